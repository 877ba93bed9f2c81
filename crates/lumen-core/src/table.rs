//! Hybrid array+hash table.

use crate::gc::GcIdx;
use crate::string::StringId;
use crate::value::TValue;
use indexmap::IndexMap;

/// Light userdata tag marking a builtin table-iteration cursor.
pub const LIGHT_TAG_ITERATOR: u8 = 0x7F;

/// Cursor flag bit: traversal stays in the array part.
const CURSOR_ARRAY_ONLY: u64 = 1 << 32;

/// A key in the hash part of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    /// Number key as normalized f64 bits (-0.0 folded into 0.0).
    Number(u64),
    String(StringId),
    Boolean(bool),
    /// GC object key, stored as raw TValue bits (identity).
    Gc(u64),
    /// Light userdata key, stored as raw TValue bits.
    Light(u64),
}

/// Errors from raw table operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("table index is nil")]
    NilIndex,
    #[error("table index is NaN")]
    NaNIndex,
    #[error("invalid key to 'next'")]
    InvalidNextKey,
}

/// Position of a builtin generic-for traversal.
///
/// `index` counts array slots first, then hash slots. `array_only` pins the
/// traversal to the array part for the whole loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterCursor {
    pub index: u32,
    pub array_only: bool,
}

impl IterCursor {
    pub fn start(array_only: bool) -> Self {
        IterCursor { index: 0, array_only }
    }

    pub fn to_tvalue(self) -> TValue {
        let flag = if self.array_only { CURSOR_ARRAY_ONLY } else { 0 };
        TValue::from_light_userdata(LIGHT_TAG_ITERATOR, flag | self.index as u64)
    }

    pub fn from_tvalue(v: TValue) -> Option<Self> {
        match v.as_light_userdata() {
            Some((LIGHT_TAG_ITERATOR, ptr)) => Some(IterCursor {
                index: ptr as u32,
                array_only: ptr & CURSOR_ARRAY_ONLY != 0,
            }),
            _ => None,
        }
    }
}

/// A table: hybrid array + insertion-ordered hash map.
pub struct Table {
    /// Array part (array[0] holds key 1).
    array: Vec<TValue>,
    /// Hash part. Deleted entries stay as nil tombstones so slot indices and
    /// traversal cursors remain stable until a new key is inserted.
    hash: IndexMap<TableKey, TValue>,
    /// Tombstones in `hash`.
    dead: usize,
    pub metatable: Option<GcIdx<Table>>,
    pub readonly: bool,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            dead: 0,
            metatable: None,
            readonly: false,
        }
    }

    /// Raw get by value key.
    pub fn raw_get(&self, key: TValue) -> TValue {
        if let Some(n) = key.as_number() {
            if let Some(i) = array_index(n, self.array.len()) {
                return self.array[i];
            }
        }
        match to_table_key(key) {
            Some(tk) => self.hash.get(&tk).copied().unwrap_or_else(TValue::nil),
            None => TValue::nil(),
        }
    }

    /// Raw set by value key.
    pub fn raw_set(&mut self, key: TValue, value: TValue) -> Result<(), TableError> {
        if key.is_nil() {
            return Err(TableError::NilIndex);
        }
        if let Some(n) = key.as_number() {
            if n.is_nan() {
                return Err(TableError::NaNIndex);
            }
            if self.try_set_array(n, value) {
                return Ok(());
            }
        }
        if let Some(tk) = to_table_key(key) {
            self.set_hash(tk, value);
        }
        Ok(())
    }

    pub fn raw_geti(&self, key: i64) -> TValue {
        self.raw_get(TValue::from_number(key as f64))
    }

    pub fn raw_seti(&mut self, key: i64, value: TValue) {
        let n = key as f64;
        if !self.try_set_array(n, value) {
            self.set_hash(TableKey::Number(normalize_number(n)), value);
        }
    }

    pub fn raw_get_str(&self, key: StringId) -> TValue {
        self.hash
            .get(&TableKey::String(key))
            .copied()
            .unwrap_or_else(TValue::nil)
    }

    pub fn raw_set_str(&mut self, key: StringId, value: TValue) {
        self.set_hash(TableKey::String(key), value);
    }

    /// Hash slot holding `key`, if any (tombstones included).
    pub fn str_slot(&self, key: StringId) -> Option<usize> {
        self.hash.get_index_of(&TableKey::String(key))
    }

    /// String lookup that first tries the predicted slot `hint`.
    /// Returns the value and the slot the key actually lives in.
    pub fn get_str_hinted(&self, key: StringId, hint: usize) -> (TValue, Option<usize>) {
        let tk = TableKey::String(key);
        if let Some((k, v)) = self.hash.get_index(hint) {
            if *k == tk {
                return (*v, Some(hint));
            }
        }
        match self.hash.get_full(&tk) {
            Some((slot, _, v)) => (*v, Some(slot)),
            None => (TValue::nil(), None),
        }
    }

    /// Overwrite the value in an existing hash slot.
    pub fn set_slot_value(&mut self, slot: usize, value: TValue) {
        if let Some((_, v)) = self.hash.get_index_mut(slot) {
            match (v.is_nil(), value.is_nil()) {
                (false, true) => self.dead += 1,
                (true, false) => self.dead -= 1,
                _ => {}
            }
            *v = value;
        }
    }

    /// Length boundary: some n with t[n] non-nil and t[n+1] nil.
    pub fn length(&self) -> usize {
        match self.array.last() {
            None => 0,
            Some(last) if !last.is_nil() => self.array.len(),
            Some(_) => {
                let (mut lo, mut hi) = (0usize, self.array.len());
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    if self.array[mid].is_nil() {
                        hi = mid;
                    } else {
                        lo = mid + 1;
                    }
                }
                lo
            }
        }
    }

    /// Size of the array part.
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Number of hash slots, tombstones included.
    pub fn node_len(&self) -> usize {
        self.hash.len()
    }

    pub fn has_live_nodes(&self) -> bool {
        self.hash.len() > self.dead
    }

    /// Write an array slot (0-based). The slot must be inside the array part.
    pub fn set_array_slot(&mut self, index: usize, value: TValue) {
        self.array[index] = value;
    }

    /// Grow the array part to `size` slots, moving integer keys that now fall
    /// inside it out of the hash part. Never shrinks.
    pub fn resize_array(&mut self, size: usize) {
        let old = self.array.len();
        if size <= old {
            return;
        }
        self.array.resize(size, TValue::nil());
        let array = &mut self.array;
        self.hash.retain(|k, v| {
            if let TableKey::Number(bits) = k {
                if let Some(i) = array_index(f64::from_bits(*bits), size) {
                    if i >= old {
                        array[i] = *v;
                        return false;
                    }
                }
            }
            true
        });
        self.dead = self.hash.values().filter(|v| v.is_nil()).count();
        self.migrate_from_hash();
    }

    /// Advance a traversal from absolute position `index` (array slots, then
    /// hash slots). Returns the position after the hit, the key and the value.
    pub fn next_from(&self, index: usize, array_only: bool) -> Option<(usize, TValue, TValue)> {
        let mut i = index;
        while i < self.array.len() {
            let v = self.array[i];
            if !v.is_nil() {
                return Some((i + 1, TValue::from_number((i + 1) as f64), v));
            }
            i += 1;
        }
        if array_only {
            return None;
        }
        self.next_node_from(i)
    }

    /// Like `next_from`, but only walks the hash part. `index` is absolute.
    pub fn next_node_from(&self, index: usize) -> Option<(usize, TValue, TValue)> {
        let sizearray = self.array.len();
        let mut i = index.max(sizearray);
        while let Some((k, v)) = self.hash.get_index(i - sizearray) {
            if !v.is_nil() {
                return Some((i + 1, from_table_key(*k), *v));
            }
            i += 1;
        }
        None
    }

    /// `next` semantics: the pair after `key`, or None at the end.
    pub fn next(&self, key: TValue) -> Result<Option<(TValue, TValue)>, TableError> {
        let start = if key.is_nil() {
            0
        } else if let Some(i) = key.as_number().and_then(|n| array_index(n, self.array.len())) {
            i + 1
        } else {
            let tk = to_table_key(key).ok_or(TableError::InvalidNextKey)?;
            let slot = self.hash.get_index_of(&tk).ok_or(TableError::InvalidNextKey)?;
            self.array.len() + slot + 1
        };
        Ok(self.next_from(start, false).map(|(_, k, v)| (k, v)))
    }

    pub fn array_values(&self) -> &[TValue] {
        &self.array
    }

    pub fn hash_entries(&self) -> impl Iterator<Item = (TValue, TValue)> + '_ {
        self.hash.iter().map(|(k, v)| (from_table_key(*k), *v))
    }

    fn try_set_array(&mut self, n: f64, value: TValue) -> bool {
        if let Some(i) = array_index(n, self.array.len()) {
            self.array[i] = value;
            return true;
        }
        if n == (self.array.len() + 1) as f64 && !value.is_nil() {
            let key = TableKey::Number(normalize_number(n));
            if self.hash.shift_remove(&key).is_some_and(|old| old.is_nil()) {
                self.dead -= 1;
            }
            self.array.push(value);
            self.migrate_from_hash();
            return true;
        }
        false
    }

    fn set_hash(&mut self, tk: TableKey, value: TValue) {
        if let Some(slot) = self.hash.get_index_of(&tk) {
            self.set_slot_value(slot, value);
        } else if !value.is_nil() {
            if self.dead > self.hash.len() - self.dead {
                self.compact();
            }
            self.hash.insert(tk, value);
        }
    }

    /// Drop all tombstones. Moves live slots, so only done when a new key
    /// goes in.
    fn compact(&mut self) {
        self.hash.retain(|_, v| !v.is_nil());
        self.dead = 0;
    }

    /// Move consecutive integer entries from the hash part onto the array end.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = TableKey::Number(normalize_number((self.array.len() + 1) as f64));
            match self.hash.get(&next) {
                Some(v) if !v.is_nil() => {
                    let v = *v;
                    self.hash.shift_remove(&next);
                    self.array.push(v);
                }
                _ => break,
            }
        }
    }
}

/// 0-based array slot for number key `n` when it falls in `1..=len`.
fn array_index(n: f64, len: usize) -> Option<usize> {
    if n >= 1.0 && n <= len as f64 && n.fract() == 0.0 {
        Some(n as usize - 1)
    } else {
        None
    }
}

fn normalize_number(n: f64) -> u64 {
    if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

fn to_table_key(v: TValue) -> Option<TableKey> {
    if let Some(n) = v.as_number() {
        return if n.is_nan() {
            None
        } else {
            Some(TableKey::Number(normalize_number(n)))
        };
    }
    if let Some(b) = v.as_bool() {
        return Some(TableKey::Boolean(b));
    }
    if let Some(sid) = v.as_string_id() {
        return Some(TableKey::String(sid));
    }
    if v.is_gc() {
        return Some(TableKey::Gc(v.raw_bits()));
    }
    if v.is_light_userdata() {
        return Some(TableKey::Light(v.raw_bits()));
    }
    None
}

fn from_table_key(k: TableKey) -> TValue {
    match k {
        TableKey::Number(bits) => TValue::from_number(f64::from_bits(bits)),
        TableKey::String(sid) => TValue::from_string_id(sid),
        TableKey::Boolean(b) => TValue::from_bool(b),
        TableKey::Gc(bits) | TableKey::Light(bits) => TValue::from_raw_bits(bits),
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={}, readonly={})",
            self.array.len(),
            self.hash.len(),
            self.readonly
        )
    }
}
