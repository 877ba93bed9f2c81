/// Interned, immutable byte strings.
///
/// Every string is interned regardless of length, so two strings with the same
/// contents always share one `StringId` and compare by id.
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// An opaque handle to a string in the interner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct StringId(pub u32);

/// A string with its precomputed hash.
#[derive(Clone)]
pub struct TString {
    bytes: Box<[u8]>,
    hash: u32,
}

impl TString {
    fn new(bytes: &[u8]) -> Self {
        TString {
            bytes: bytes.into(),
            hash: lua_hash(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl fmt::Debug for TString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = std::str::from_utf8(self.as_bytes()) {
            write!(f, "\"{}\"", s)
        } else {
            write!(f, "<binary string len={}>", self.len())
        }
    }
}

/// Lua-family string hash (luaS_hash stepping).
pub fn lua_hash(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }
    h
}

/// Owns all strings and deduplicates them.
#[derive(Debug, Default)]
pub struct StringInterner {
    strings: Vec<TString>,
    lookup: HashMap<u32, Vec<u32>>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a byte string, returning the existing id when already present.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        let hash = lua_hash(bytes);
        if let Some(ids) = self.lookup.get(&hash) {
            for &id in ids {
                if self.strings[id as usize].as_bytes() == bytes {
                    return StringId(id);
                }
            }
        }
        let id = self.strings.len() as u32;
        self.strings.push(TString::new(bytes));
        self.lookup.entry(hash).or_default().push(id);
        StringId(id)
    }

    pub fn intern_str(&mut self, s: &str) -> StringId {
        self.intern(s.as_bytes())
    }

    /// Find an already-interned string without creating it.
    pub fn find(&self, bytes: &[u8]) -> Option<StringId> {
        self.lookup
            .get(&lua_hash(bytes))?
            .iter()
            .copied()
            .find(|&id| self.strings[id as usize].as_bytes() == bytes)
            .map(StringId)
    }

    pub fn get(&self, id: StringId) -> &TString {
        &self.strings[id.0 as usize]
    }

    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        self.strings[id.0 as usize].as_bytes()
    }

    /// Lossy UTF-8 view, for messages.
    pub fn get_lossy(&self, id: StringId) -> Cow<'_, str> {
        String::from_utf8_lossy(self.get_bytes(id))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
