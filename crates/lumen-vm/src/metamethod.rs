//! Metamethod lookup.

use lumen_core::gc::{GcHeap, GcIdx};
use lumen_core::string::{StringId, StringInterner};
use lumen_core::table::Table;
use lumen_core::value::TValue;

/// Metamethods consulted by the execution core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tm {
    Index,
    NewIndex,
    Call,
    Iter,
    NameCall,
}

/// Pre-interned metamethod name StringIds for fast lookup.
#[derive(Clone, Debug)]
pub struct MetamethodNames {
    pub index: StringId,
    pub newindex: StringId,
    pub call: StringId,
    pub iter: StringId,
    pub namecall: StringId,
}

impl MetamethodNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        MetamethodNames {
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            iter: strings.intern(b"__iter"),
            namecall: strings.intern(b"__namecall"),
        }
    }

    pub fn name(&self, tm: Tm) -> StringId {
        match tm {
            Tm::Index => self.index,
            Tm::NewIndex => self.newindex,
            Tm::Call => self.call,
            Tm::Iter => self.iter,
            Tm::NameCall => self.namecall,
        }
    }
}

/// Metamethod `tm` in metatable `mt`, if set.
pub fn fast_tm(gc: &GcHeap, names: &MetamethodNames, mt: Option<GcIdx<Table>>, tm: Tm) -> Option<TValue> {
    let mm = gc.get_table(mt?).raw_get_str(names.name(tm));
    if mm.is_nil() {
        None
    } else {
        Some(mm)
    }
}

/// Look up a metamethod on any value that can carry a metatable.
pub fn get_metamethod(gc: &GcHeap, names: &MetamethodNames, val: TValue, tm: Tm) -> Option<TValue> {
    fast_tm(gc, names, gc.metatable_of(val), tm)
}
