//! Arena heap with typed indices and a mark-sweep collector.

use crate::string::{StringId, StringInterner};
use crate::table::Table;
use crate::value::TValue;
use std::marker::PhantomData;

/// A typed index into an arena in the GcHeap.
#[derive(Debug)]
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> GcIdx<T> {
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Sub-tags for GC objects (stored in bits 44-46 of payload).
pub const GC_SUB_TABLE: u64 = 0;
pub const GC_SUB_CLOSURE: u64 = 1;
pub const GC_SUB_NATIVE: u64 = 2;
pub const GC_SUB_USERDATA: u64 = 3;
pub const GC_SUB_THREAD: u64 = 4;
pub const GC_SUB_STRING: u64 = 5;

/// Bits used for sub-tag within the 47-bit payload.
pub const GC_SUB_SHIFT: u64 = 44;
pub const GC_SUB_MASK: u64 = 0x7;
/// Mask for the index within the payload.
pub const GC_INDEX_MASK: u64 = (1u64 << 44) - 1;

/// An upvalue reference held by a Luau closure.
#[derive(Clone, Copy, Debug)]
pub enum UpvalRef {
    /// Captured by value.
    Value(TValue),
    /// Shared cell, open or closed.
    Cell(GcIdx<UpVal>),
}

impl UpvalRef {
    /// Identity/value equality used by DUPCLOSURE reuse checks.
    pub fn raw_eq(&self, other: &UpvalRef) -> bool {
        match (self, other) {
            (UpvalRef::Value(a), UpvalRef::Value(b)) => a.raw_equal(b),
            (UpvalRef::Cell(a), UpvalRef::Cell(b)) => a == b,
            _ => false,
        }
    }
}

/// A Luau closure.
#[derive(Clone, Debug)]
pub struct LuaClosure {
    /// Index of the prototype in the VM's proto store.
    pub proto_idx: usize,
    pub env: GcIdx<Table>,
    pub upvals: Vec<UpvalRef>,
    /// Created at load time for a DUPCLOSURE constant and not yet filled.
    pub preload: bool,
}

/// A shared upvalue cell.
#[derive(Debug)]
pub struct UpVal {
    pub location: UpValLocation,
}

#[derive(Clone, Copy, Debug)]
pub enum UpValLocation {
    /// Points at a live stack slot.
    Open(usize),
    Closed(TValue),
}

/// Errors raised by native functions.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NativeError {
    #[error("{0}")]
    Message(String),
    /// An arbitrary error value, as passed to `error(v)`.
    #[error("error object is a {0:?} value")]
    Value(TValue),
}

pub type NativeFn = fn(&mut NativeContext) -> Result<Vec<TValue>, NativeError>;

/// A native (Rust) function callable from Luau.
pub struct NativeFunction {
    pub func: NativeFn,
    pub name: &'static str,
    pub upvals: Vec<TValue>,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "native({})", self.name)
    }
}

/// Context passed to native functions.
pub struct NativeContext<'a> {
    pub args: &'a [TValue],
    pub gc: &'a mut GcHeap,
    pub strings: &'a mut StringInterner,
    /// The function being called, for upvalue access.
    pub callee: GcIdx<NativeFunction>,
    /// Method name when invoked through a `__namecall` metamethod.
    pub namecall: Option<StringId>,
}

impl NativeContext<'_> {
    pub fn arg(&self, i: usize) -> TValue {
        self.args.get(i).copied().unwrap_or_else(TValue::nil)
    }

    pub fn upvalue(&self, i: usize) -> TValue {
        self.gc
            .get_native(self.callee)
            .upvals
            .get(i)
            .copied()
            .unwrap_or_else(TValue::nil)
    }

    pub fn set_upvalue(&mut self, i: usize, v: TValue) {
        let upvals = &mut self.gc.get_native_mut(self.callee).upvals;
        if i >= upvals.len() {
            upvals.resize(i + 1, TValue::nil());
        }
        upvals[i] = v;
    }
}

/// Full userdata: opaque bytes plus a metatable.
#[derive(Debug)]
pub struct Userdata {
    pub metatable: Option<GcIdx<Table>>,
    pub tag: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Suspended,
    Dead,
}

/// A thread object with its own saved stack. Never scheduled here.
#[derive(Debug)]
pub struct ThreadState {
    pub stack: Vec<TValue>,
    pub status: ThreadStatus,
}

/// One object arena. Freed slots are reused through a free list.
pub struct Arena<T> {
    kind: &'static str,
    slots: Vec<Option<T>>,
    free: Vec<u32>,
    marks: Vec<bool>,
}

impl<T> Arena<T> {
    fn new(kind: &'static str) -> Self {
        Arena {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            marks: Vec::new(),
        }
    }

    fn alloc(&mut self, item: T) -> GcIdx<T> {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(item);
            GcIdx(idx, PhantomData)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(item));
            self.marks.push(false);
            GcIdx(idx, PhantomData)
        }
    }

    #[inline]
    fn get(&self, idx: GcIdx<T>) -> &T {
        match self.slots.get(idx.0 as usize) {
            Some(Some(v)) => v,
            _ => panic!("{} {} was freed", self.kind, idx.0),
        }
    }

    #[inline]
    fn get_mut(&mut self, idx: GcIdx<T>) -> &mut T {
        match self.slots.get_mut(idx.0 as usize) {
            Some(Some(v)) => v,
            _ => panic!("{} {} was freed", self.kind, idx.0),
        }
    }

    fn is_live(&self, index: u32) -> bool {
        matches!(self.slots.get(index as usize), Some(Some(_)))
    }

    /// Number of allocated objects.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Mark slot `index`; true when it was live and not yet marked.
    fn mark(&mut self, index: u32) -> bool {
        let i = index as usize;
        if !self.is_live(index) || self.marks[i] {
            return false;
        }
        self.marks[i] = true;
        true
    }

    fn clear_marks(&mut self) {
        self.marks.iter_mut().for_each(|m| *m = false);
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_some() && !self.marks[i] {
                *slot = None;
                self.free.push(i as u32);
                freed += 1;
            }
        }
        freed
    }
}

/// Allocations between collections when the heap is small.
pub const GC_MIN_THRESHOLD: usize = 1024;

/// Arena-based heap with a stop-the-world mark-sweep collector.
///
/// The heap does not know its roots: the owner marks them with
/// `gc_mark_value`, then runs `gc_propagate` and `gc_sweep`. Interned
/// strings live in the `StringInterner` and are never collected.
pub struct GcHeap {
    tables: Arena<Table>,
    closures: Arena<LuaClosure>,
    natives: Arena<NativeFunction>,
    upvals: Arena<UpVal>,
    userdata: Arena<Userdata>,
    threads: Arena<ThreadState>,
    /// Shared metatable for all strings.
    pub string_metatable: Option<GcIdx<Table>>,
    gray: Vec<TValue>,
    gray_upvals: Vec<GcIdx<UpVal>>,
    /// Allocations since the last collection.
    allocated: usize,
    threshold: usize,
    min_threshold: usize,
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHeap {
    pub fn new() -> Self {
        GcHeap {
            tables: Arena::new("table"),
            closures: Arena::new("closure"),
            natives: Arena::new("native function"),
            upvals: Arena::new("upvalue"),
            userdata: Arena::new("userdata"),
            threads: Arena::new("thread"),
            string_metatable: None,
            gray: Vec::new(),
            gray_upvals: Vec::new(),
            allocated: 0,
            threshold: GC_MIN_THRESHOLD,
            min_threshold: GC_MIN_THRESHOLD,
        }
    }

    /// Set the smallest allocation count that triggers a collection.
    pub fn set_min_threshold(&mut self, n: usize) {
        self.min_threshold = n.max(1);
        self.threshold = self.min_threshold;
    }

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> GcIdx<Table> {
        self.allocated += 1;
        self.tables.alloc(Table::new(array_hint, hash_hint))
    }

    pub fn get_table(&self, idx: GcIdx<Table>) -> &Table {
        self.tables.get(idx)
    }

    pub fn get_table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        self.tables.get_mut(idx)
    }

    pub fn alloc_closure(&mut self, closure: LuaClosure) -> GcIdx<LuaClosure> {
        self.allocated += 1;
        self.closures.alloc(closure)
    }

    pub fn get_closure(&self, idx: GcIdx<LuaClosure>) -> &LuaClosure {
        self.closures.get(idx)
    }

    pub fn get_closure_mut(&mut self, idx: GcIdx<LuaClosure>) -> &mut LuaClosure {
        self.closures.get_mut(idx)
    }

    pub fn alloc_native(
        &mut self,
        func: NativeFn,
        name: &'static str,
        upvals: Vec<TValue>,
    ) -> GcIdx<NativeFunction> {
        self.allocated += 1;
        self.natives.alloc(NativeFunction { func, name, upvals })
    }

    pub fn get_native(&self, idx: GcIdx<NativeFunction>) -> &NativeFunction {
        self.natives.get(idx)
    }

    pub fn get_native_mut(&mut self, idx: GcIdx<NativeFunction>) -> &mut NativeFunction {
        self.natives.get_mut(idx)
    }

    pub fn alloc_upval(&mut self, location: UpValLocation) -> GcIdx<UpVal> {
        self.allocated += 1;
        self.upvals.alloc(UpVal { location })
    }

    pub fn get_upval(&self, idx: GcIdx<UpVal>) -> &UpVal {
        self.upvals.get(idx)
    }

    pub fn get_upval_mut(&mut self, idx: GcIdx<UpVal>) -> &mut UpVal {
        self.upvals.get_mut(idx)
    }

    pub fn alloc_userdata(&mut self, tag: u8, data: Vec<u8>) -> GcIdx<Userdata> {
        self.allocated += 1;
        self.userdata.alloc(Userdata {
            metatable: None,
            tag,
            data,
        })
    }

    pub fn get_userdata(&self, idx: GcIdx<Userdata>) -> &Userdata {
        self.userdata.get(idx)
    }

    pub fn get_userdata_mut(&mut self, idx: GcIdx<Userdata>) -> &mut Userdata {
        self.userdata.get_mut(idx)
    }

    /// A suspended thread holding `stack` as its saved values.
    pub fn alloc_thread(&mut self, stack: Vec<TValue>) -> GcIdx<ThreadState> {
        self.allocated += 1;
        self.threads.alloc(ThreadState {
            stack,
            status: ThreadStatus::Suspended,
        })
    }

    pub fn get_thread(&self, idx: GcIdx<ThreadState>) -> &ThreadState {
        self.threads.get(idx)
    }

    pub fn get_thread_mut(&mut self, idx: GcIdx<ThreadState>) -> &mut ThreadState {
        self.threads.get_mut(idx)
    }

    /// Metatable of any value that can carry one.
    pub fn metatable_of(&self, v: TValue) -> Option<GcIdx<Table>> {
        if let Some(t) = v.as_table_idx() {
            self.get_table(t).metatable
        } else if let Some(u) = v.as_userdata_idx() {
            self.get_userdata(u).metatable
        } else if v.is_string() {
            self.string_metatable
        } else {
            None
        }
    }

    // ---- Garbage collection ----

    /// Objects currently allocated, across all arenas.
    pub fn live_objects(&self) -> usize {
        self.tables.live()
            + self.closures.live()
            + self.natives.live()
            + self.upvals.live()
            + self.userdata.live()
            + self.threads.live()
    }

    /// True when `v` is a heap object that has not been freed. Non-heap
    /// values and strings are always alive.
    pub fn is_alive(&self, v: TValue) -> bool {
        let Some(index) = v.gc_index() else {
            return true;
        };
        match v.gc_sub_tag() {
            Some(GC_SUB_TABLE) => self.tables.is_live(index),
            Some(GC_SUB_CLOSURE) => self.closures.is_live(index),
            Some(GC_SUB_NATIVE) => self.natives.is_live(index),
            Some(GC_SUB_USERDATA) => self.userdata.is_live(index),
            Some(GC_SUB_THREAD) => self.threads.is_live(index),
            _ => true,
        }
    }

    pub fn gc_should_step(&self) -> bool {
        self.allocated >= self.threshold
    }

    /// Start a cycle: every object becomes unmarked.
    pub fn gc_prepare_marks(&mut self) {
        self.tables.clear_marks();
        self.closures.clear_marks();
        self.natives.clear_marks();
        self.upvals.clear_marks();
        self.userdata.clear_marks();
        self.threads.clear_marks();
        self.gray.clear();
        self.gray_upvals.clear();
    }

    /// Mark a root value.
    pub fn gc_mark_value(&mut self, v: TValue) {
        let Some(index) = v.gc_index() else {
            return;
        };
        let newly = match v.gc_sub_tag() {
            Some(GC_SUB_TABLE) => self.tables.mark(index),
            Some(GC_SUB_CLOSURE) => self.closures.mark(index),
            Some(GC_SUB_NATIVE) => self.natives.mark(index),
            Some(GC_SUB_USERDATA) => self.userdata.mark(index),
            Some(GC_SUB_THREAD) => self.threads.mark(index),
            _ => false,
        };
        if newly {
            self.gray.push(v);
        }
    }

    /// Mark a root upvalue cell.
    pub fn gc_mark_upval(&mut self, idx: GcIdx<UpVal>) {
        if self.upvals.mark(idx.0) {
            self.gray_upvals.push(idx);
        }
    }

    fn gc_mark_table(&mut self, idx: GcIdx<Table>) {
        self.gc_mark_value(TValue::from_table(idx));
    }

    /// Traverse gray objects until none remain. Returns the number traversed.
    pub fn gc_propagate(&mut self) -> usize {
        let mut work = 0;
        let mut children = Vec::new();
        loop {
            if let Some(uv) = self.gray_upvals.pop() {
                work += 1;
                if let UpValLocation::Closed(v) = self.get_upval(uv).location {
                    self.gc_mark_value(v);
                }
                continue;
            }
            let Some(obj) = self.gray.pop() else {
                break;
            };
            work += 1;
            children.clear();
            if let Some(t) = obj.as_table_idx() {
                let table = self.get_table(t);
                if let Some(mt) = table.metatable {
                    children.push(TValue::from_table(mt));
                }
                children.extend_from_slice(table.array_values());
                for (k, v) in table.hash_entries() {
                    children.push(k);
                    children.push(v);
                }
            } else if let Some(c) = obj.as_closure_idx() {
                let cl = self.get_closure(c);
                let env = cl.env;
                let upvals = cl.upvals.clone();
                self.gc_mark_table(env);
                for uv in upvals {
                    match uv {
                        UpvalRef::Value(v) => children.push(v),
                        UpvalRef::Cell(cell) => self.gc_mark_upval(cell),
                    }
                }
            } else if let Some(n) = obj.as_native_idx() {
                children.extend_from_slice(&self.get_native(n).upvals);
            } else if let Some(u) = obj.as_userdata_idx() {
                if let Some(mt) = self.get_userdata(u).metatable {
                    children.push(TValue::from_table(mt));
                }
            } else if let Some(th) = obj.as_thread_idx() {
                children.extend_from_slice(&self.get_thread(th).stack);
            }
            for &child in &children {
                self.gc_mark_value(child);
            }
        }
        work
    }

    /// Free every unmarked object and reset the allocation debt. Returns the
    /// number of objects freed.
    pub fn gc_sweep(&mut self) -> usize {
        let freed = self.tables.sweep()
            + self.closures.sweep()
            + self.natives.sweep()
            + self.upvals.sweep()
            + self.userdata.sweep()
            + self.threads.sweep();
        self.allocated = 0;
        self.threshold = (self.live_objects() * 2).max(self.min_threshold);
        freed
    }
}
