/// NaN-boxed Luau value representation.
///
/// Layout (64 bits):
/// - Pure f64: any non-NaN double (NaN canonicalized to QNAN)
/// - Tagged values: QNAN prefix (0x7FF8) | tag (3 bits, 47-49) | payload (47 bits)
///
/// Tags (bits 49-47):
///   000 = canonical NaN (no payload)
///   001 = nil
///   010 = bool
///   011 = GC object (sub-tag in payload bits 44-46)
///   100 = light userdata (7-bit tag in payload bits 40-46)
use crate::gc::*;
use crate::string::StringId;
use std::fmt;
use std::marker::PhantomData;

/// Quiet NaN prefix: exponent all 1s + quiet bit set
const QNAN: u64 = 0x7FF8_0000_0000_0000;

/// Tag mask: 3 bits at positions 47-49
const TAG_MASK: u64 = 0x0007_0000_0000_0000;
/// Payload mask: lower 47 bits
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const TAG_NIL: u64 = 0x0001_0000_0000_0000;
const TAG_BOOL: u64 = 0x0002_0000_0000_0000;
const TAG_GC: u64 = 0x0003_0000_0000_0000;
const TAG_LIGHT: u64 = 0x0004_0000_0000_0000;

/// Light userdata tag bits within the payload.
const LIGHT_TAG_SHIFT: u64 = 40;
const LIGHT_TAG_MASK: u64 = 0x7F;
/// Largest pointer payload a light userdata can carry (40 bits).
pub const LIGHT_PTR_MASK: u64 = (1u64 << LIGHT_TAG_SHIFT) - 1;

/// A NaN-boxed value packed into 8 bytes.
#[derive(Clone, Copy)]
pub struct TValue(u64);

impl TValue {
    // ---- Constructors ----

    #[inline]
    pub fn nil() -> Self {
        TValue(QNAN | TAG_NIL)
    }

    #[inline]
    pub fn from_bool(b: bool) -> Self {
        TValue(QNAN | TAG_BOOL | (b as u64))
    }

    /// Create a number value. NaN inputs are canonicalized.
    #[inline]
    pub fn from_number(n: f64) -> Self {
        if n.is_nan() {
            TValue(QNAN)
        } else {
            TValue(n.to_bits())
        }
    }

    /// Create a tagged light userdata. Only the low 40 bits of `ptr` are kept.
    #[inline]
    pub fn from_light_userdata(tag: u8, ptr: u64) -> Self {
        debug_assert!(ptr & !LIGHT_PTR_MASK == 0, "light userdata payload exceeds 40 bits");
        let payload = ((tag as u64 & LIGHT_TAG_MASK) << LIGHT_TAG_SHIFT) | (ptr & LIGHT_PTR_MASK);
        TValue(QNAN | TAG_LIGHT | payload)
    }

    // ---- Type checks ----

    /// Returns true if this is a NaN-boxed tagged value (not a plain number).
    #[inline]
    fn is_tagged(&self) -> bool {
        (self.0 & QNAN) == QNAN
    }

    #[inline]
    fn tag(&self) -> u64 {
        self.0 & TAG_MASK
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.is_tagged() && self.tag() == TAG_NIL
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        self.is_tagged() && self.tag() == TAG_BOOL
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        !self.is_tagged() || self.tag() == 0
    }

    #[inline]
    pub fn is_gc(&self) -> bool {
        self.is_tagged() && self.tag() == TAG_GC
    }

    #[inline]
    pub fn is_light_userdata(&self) -> bool {
        self.is_tagged() && self.tag() == TAG_LIGHT
    }

    // ---- Extractors ----

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        if !self.is_tagged() {
            Some(f64::from_bits(self.0))
        } else if self.tag() == 0 {
            Some(f64::from_bits(QNAN))
        } else {
            None
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        if self.is_bool() {
            Some((self.0 & 1) != 0)
        } else {
            None
        }
    }

    /// Extract `(tag, ptr)` from a light userdata.
    #[inline]
    pub fn as_light_userdata(&self) -> Option<(u8, u64)> {
        if self.is_light_userdata() {
            let payload = self.0 & PAYLOAD_MASK;
            Some((
                ((payload >> LIGHT_TAG_SHIFT) & LIGHT_TAG_MASK) as u8,
                payload & LIGHT_PTR_MASK,
            ))
        } else {
            None
        }
    }

    // ---- GC sub-tag helpers ----

    /// Create a GC value with a sub-tag and index.
    #[inline]
    pub fn from_gc_sub(sub_tag: u64, index: u32) -> Self {
        let payload = (sub_tag << GC_SUB_SHIFT) | (index as u64);
        debug_assert!(payload & !PAYLOAD_MASK == 0);
        TValue(QNAN | TAG_GC | payload)
    }

    /// Extract the GC sub-tag (bits 44-46 of payload).
    #[inline]
    pub fn gc_sub_tag(&self) -> Option<u64> {
        if self.is_gc() {
            Some(((self.0 & PAYLOAD_MASK) >> GC_SUB_SHIFT) & GC_SUB_MASK)
        } else {
            None
        }
    }

    /// Extract the GC index (bits 0-43 of payload).
    #[inline]
    pub fn gc_index(&self) -> Option<u32> {
        if self.is_gc() {
            Some(self.payload_index())
        } else {
            None
        }
    }

    #[inline]
    fn payload_index(&self) -> u32 {
        ((self.0 & PAYLOAD_MASK) & GC_INDEX_MASK) as u32
    }

    #[inline]
    fn sub_index<T>(&self, sub_tag: u64) -> Option<GcIdx<T>> {
        if self.gc_sub_tag() == Some(sub_tag) {
            Some(GcIdx(self.payload_index(), PhantomData))
        } else {
            None
        }
    }

    #[inline]
    pub fn from_string_id(id: StringId) -> Self {
        Self::from_gc_sub(GC_SUB_STRING, id.0)
    }

    #[inline]
    pub fn as_string_id(&self) -> Option<StringId> {
        if self.gc_sub_tag() == Some(GC_SUB_STRING) {
            Some(StringId(self.payload_index()))
        } else {
            None
        }
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.gc_sub_tag() == Some(GC_SUB_STRING)
    }

    #[inline]
    pub fn from_table(idx: GcIdx<crate::table::Table>) -> Self {
        Self::from_gc_sub(GC_SUB_TABLE, idx.0)
    }

    #[inline]
    pub fn as_table_idx(&self) -> Option<GcIdx<crate::table::Table>> {
        self.sub_index(GC_SUB_TABLE)
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        self.gc_sub_tag() == Some(GC_SUB_TABLE)
    }

    #[inline]
    pub fn from_closure(idx: GcIdx<LuaClosure>) -> Self {
        Self::from_gc_sub(GC_SUB_CLOSURE, idx.0)
    }

    #[inline]
    pub fn as_closure_idx(&self) -> Option<GcIdx<LuaClosure>> {
        self.sub_index(GC_SUB_CLOSURE)
    }

    #[inline]
    pub fn from_native(idx: GcIdx<NativeFunction>) -> Self {
        Self::from_gc_sub(GC_SUB_NATIVE, idx.0)
    }

    #[inline]
    pub fn as_native_idx(&self) -> Option<GcIdx<NativeFunction>> {
        self.sub_index(GC_SUB_NATIVE)
    }

    #[inline]
    pub fn from_userdata(idx: GcIdx<Userdata>) -> Self {
        Self::from_gc_sub(GC_SUB_USERDATA, idx.0)
    }

    #[inline]
    pub fn as_userdata_idx(&self) -> Option<GcIdx<Userdata>> {
        self.sub_index(GC_SUB_USERDATA)
    }

    #[inline]
    pub fn from_thread(idx: GcIdx<ThreadState>) -> Self {
        Self::from_gc_sub(GC_SUB_THREAD, idx.0)
    }

    #[inline]
    pub fn as_thread_idx(&self) -> Option<GcIdx<ThreadState>> {
        self.sub_index(GC_SUB_THREAD)
    }

    /// Returns true if this is any kind of function (Luau closure or native).
    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(
            self.gc_sub_tag(),
            Some(GC_SUB_CLOSURE) | Some(GC_SUB_NATIVE)
        )
    }

    // ---- Luau semantics ----

    /// Only nil and false are falsy.
    #[inline]
    pub fn is_falsy(&self) -> bool {
        self.is_nil() || (self.is_bool() && self.as_bool() == Some(false))
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    /// Primitive equality: numbers by value (NaN never equal), everything
    /// else by identity. Strings are interned, so identity is value equality.
    #[inline]
    pub fn raw_equal(&self, other: &TValue) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.0 == other.0,
            _ => false,
        }
    }

    #[inline]
    pub fn raw_bits(&self) -> u64 {
        self.0
    }

    /// Reconstruct a value from bits produced by `raw_bits`.
    #[inline]
    pub fn from_raw_bits(bits: u64) -> Self {
        TValue(bits)
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else if let Some(b) = self.as_bool() {
            write!(f, "{b}")
        } else if let Some(n) = self.as_number() {
            write!(f, "{n}")
        } else if let Some(sub) = self.gc_sub_tag() {
            let idx = self.payload_index();
            match sub {
                GC_SUB_STRING => write!(f, "string(#{idx})"),
                GC_SUB_TABLE => write!(f, "table(#{idx})"),
                GC_SUB_CLOSURE => write!(f, "closure(#{idx})"),
                GC_SUB_NATIVE => write!(f, "native(#{idx})"),
                GC_SUB_USERDATA => write!(f, "userdata(#{idx})"),
                GC_SUB_THREAD => write!(f, "thread(#{idx})"),
                _ => write!(f, "gc({:#x})", self.0 & PAYLOAD_MASK),
            }
        } else if let Some((tag, ptr)) = self.as_light_userdata() {
            write!(f, "lightuserdata({tag}:{ptr:#x})")
        } else {
            write!(f, "unknown({:#018x})", self.0)
        }
    }
}

impl PartialEq for TValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equal(other)
    }
}
