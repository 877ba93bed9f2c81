//! Execution context.

use std::cell::Cell;
use std::rc::Rc;

use lumen_core::gc::{
    GcHeap, GcIdx, LuaClosure, NativeFn, UpVal, UpValLocation, UpvalRef,
};
use lumen_core::string::{StringId, StringInterner};
use lumen_core::table::Table;
use lumen_core::value::TValue;
use tracing::debug;

use crate::baselib;
use crate::call;
use crate::callinfo::CallInfo;
use crate::config::VmOptions;
use crate::error::LuaError;
use crate::limits::{EXTRA_STACK, LUA_MINSTACK, LUA_MULTRET};
use crate::metamethod::MetamethodNames;
use crate::opcode::CaptureKind;
use crate::proto::{Constant, Proto};

/// One execution context: value stack, frames, heap and globals.
///
/// Every operation takes the context explicitly; there is no global VM.
/// Stack positions are offsets into `stack` and must be recomputed from
/// `CallInfo::base` after anything that can grow it.
pub struct Vm {
    /// Value stack. Always at least `top + EXTRA_STACK` long.
    pub stack: Vec<TValue>,
    /// First free slot.
    pub top: usize,
    /// Frame stack. Entry 0 is the host frame and is never popped.
    pub call_stack: Vec<CallInfo>,
    pub gc: GcHeap,
    pub strings: StringInterner,
    /// Loaded prototypes, flattened.
    pub protos: Vec<Rc<Proto>>,
    /// Open upvalue cells, sorted by stack index descending.
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    pub globals: GcIdx<Table>,
    pub mm_names: MetamethodNames,
    pub options: VmOptions,
    /// Nesting depth of host-level calls.
    pub c_calls: usize,
    /// Error raised inside native code, picked up when it returns.
    pub pending_error: Option<LuaError>,
    /// Method name for the next `__namecall` invocation.
    pub namecall: Option<StringId>,
    pub builtin_next: TValue,
    pub builtin_inext: TValue,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut strings = StringInterner::new();
        let mm_names = MetamethodNames::init(&mut strings);
        let mut gc = GcHeap::new();
        gc.set_min_threshold(options.gc_min_threshold);
        let globals = gc.alloc_table(0, 16);

        let host_top = 1 + LUA_MINSTACK;
        let size = options.initial_stack_size.max(host_top) + EXTRA_STACK;
        let mut vm = Vm {
            stack: vec![TValue::nil(); size],
            top: 1,
            call_stack: vec![CallInfo::new(0, 1, host_top, LUA_MULTRET)],
            gc,
            strings,
            protos: Vec::new(),
            open_upvals: Vec::new(),
            globals,
            mm_names,
            options,
            c_calls: 0,
            pending_error: None,
            namecall: None,
            builtin_next: TValue::nil(),
            builtin_inext: TValue::nil(),
        };
        baselib::open(&mut vm);
        vm
    }

    #[inline(always)]
    pub fn ci(&self) -> &CallInfo {
        &self.call_stack[self.call_stack.len() - 1]
    }

    #[inline(always)]
    pub fn ci_mut(&mut self) -> &mut CallInfo {
        let last = self.call_stack.len() - 1;
        &mut self.call_stack[last]
    }

    /// Make slots `[0, end)` available plus `EXTRA_STACK` slack.
    ///
    /// Grows to twice the current size, or by exactly the shortfall when that
    /// is larger.
    pub fn reserve(&mut self, end: usize) -> Result<(), LuaError> {
        let needed = end + EXTRA_STACK;
        let size = self.stack.len();
        if needed <= size {
            return Ok(());
        }
        if end > self.options.max_stack_size {
            debug!(
                target: "lumen::vm::stack",
                needed = end,
                limit = self.options.max_stack_size,
                "stack limit reached"
            );
            return Err(LuaError::StackOverflow);
        }
        let n = needed - size;
        let grown = if n <= size { 2 * size } else { size + n };
        let new_size = grown
            .min(self.options.max_stack_size + EXTRA_STACK)
            .max(needed);
        debug!(target: "lumen::vm::stack", old = size, new = new_size, "stack reallocated");
        self.stack.resize(new_size, TValue::nil());
        Ok(())
    }

    /// Room for `n` more values above `top`.
    #[inline]
    pub fn check_stack(&mut self, n: usize) -> Result<(), LuaError> {
        self.reserve(self.top + n)
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        self.strings.intern_str(s)
    }

    pub fn str_value(&mut self, s: &str) -> TValue {
        TValue::from_string_id(self.strings.intern_str(s))
    }

    pub fn get_global(&mut self, name: &str) -> TValue {
        let sid = self.intern(name);
        self.gc.get_table(self.globals).raw_get_str(sid)
    }

    pub fn set_global(&mut self, name: &str, val: TValue) {
        let sid = self.intern(name);
        self.gc.get_table_mut(self.globals).raw_set_str(sid, val);
    }

    pub fn new_native(&mut self, name: &'static str, func: NativeFn, upvals: Vec<TValue>) -> TValue {
        TValue::from_native(self.gc.alloc_native(func, name, upvals))
    }

    /// Create a native function and store it as a global.
    pub fn register(&mut self, name: &'static str, func: NativeFn) -> TValue {
        let f = self.new_native(name, func, Vec::new());
        self.set_global(name, f);
        f
    }

    pub fn new_table(&mut self) -> TValue {
        TValue::from_table(self.gc.alloc_table(0, 0))
    }

    /// A suspended thread value with `saved` as its stack. Threads are never
    /// resumed by this context.
    pub fn new_thread(&mut self, saved: Vec<TValue>) -> TValue {
        TValue::from_thread(self.gc.alloc_thread(saved))
    }

    /// Load a prototype tree and return its main closure over the globals.
    pub fn load(&mut self, proto: Proto) -> TValue {
        let env = self.globals;
        self.load_with_env(proto, env)
    }

    pub fn load_with_env(&mut self, proto: Proto, env: GcIdx<Table>) -> TValue {
        let idx = self.register_proto(proto, env);
        let nups = self.protos[idx].num_upvalues as usize;
        let cl = self.gc.alloc_closure(LuaClosure {
            proto_idx: idx,
            env,
            upvals: vec![UpvalRef::Value(TValue::nil()); nups],
            preload: false,
        });
        TValue::from_closure(cl)
    }

    fn register_proto(&mut self, mut proto: Proto, env: GcIdx<Table>) -> usize {
        let children: Vec<usize> = std::mem::take(&mut proto.protos)
            .into_iter()
            .map(|child| self.register_proto(child, env))
            .collect();

        let mut k = Vec::with_capacity(proto.constants.len());
        for c in &proto.constants {
            k.push(match c {
                Constant::Nil => TValue::nil(),
                Constant::Boolean(b) => TValue::from_bool(*b),
                Constant::Number(n) => TValue::from_number(*n),
                Constant::String(sid) => TValue::from_string_id(*sid),
                Constant::Closure(i) => {
                    let child = children[*i];
                    let nups = self.protos[child].num_upvalues as usize;
                    let cl = self.gc.alloc_closure(LuaClosure {
                        proto_idx: child,
                        env,
                        upvals: vec![UpvalRef::Value(TValue::nil()); nups],
                        preload: true,
                    });
                    TValue::from_closure(cl)
                }
            });
        }

        proto.slot_hints = (0..proto.code.len()).map(|_| Cell::new(0)).collect();
        proto.children = children;
        proto.k = k;
        self.protos.push(Rc::new(proto));
        self.protos.len() - 1
    }

    /// Call `func` with `args` under a protected boundary.
    pub fn call(&mut self, func: TValue, args: &[TValue]) -> Result<Vec<TValue>, LuaError> {
        call::pcall(self, func, args)
    }

    // ---- Garbage collection ----

    /// Run a full mark-sweep cycle. Returns the number of objects freed.
    ///
    /// Values held only by the host (outside the stack, globals and the
    /// other roots) are not kept alive.
    pub fn gc_collect(&mut self) -> usize {
        self.gc.gc_prepare_marks();
        self.gc_mark_roots();
        self.gc.gc_propagate();
        let freed = self.gc.gc_sweep();
        debug!(target: "lumen::vm::gc", freed, live = self.gc.live_objects(), "collected");
        freed
    }

    fn gc_mark_roots(&mut self) {
        // Registers of every frame, up to the highest frame top.
        let end = self
            .call_stack
            .iter()
            .map(|ci| ci.top)
            .fold(self.top, usize::max)
            .min(self.stack.len());
        for i in 0..end {
            self.gc.gc_mark_value(self.stack[i]);
        }
        for ci in &self.call_stack {
            if let Some(cl) = ci.closure {
                self.gc.gc_mark_value(TValue::from_closure(cl));
            }
        }
        self.gc.gc_mark_value(TValue::from_table(self.globals));
        for proto in &self.protos {
            for &k in &proto.k {
                self.gc.gc_mark_value(k);
            }
        }
        for &(_, uv) in &self.open_upvals {
            self.gc.gc_mark_upval(uv);
        }
        if let Some(mt) = self.gc.string_metatable {
            self.gc.gc_mark_value(TValue::from_table(mt));
        }
        self.gc.gc_mark_value(self.builtin_next);
        self.gc.gc_mark_value(self.builtin_inext);
        if let Some(LuaError::Value(v)) = &self.pending_error {
            self.gc.gc_mark_value(*v);
        }
    }

    /// Collect when enough has been allocated since the last cycle. Only
    /// called where every live value is reachable from the roots.
    pub fn gc_check(&mut self) {
        if self.gc.gc_should_step() {
            self.gc_collect();
        }
    }

    // ---- Upvalues ----

    /// Get an upvalue's current value.
    pub fn get_upval_value(&self, uv_idx: GcIdx<UpVal>) -> TValue {
        match self.gc.get_upval(uv_idx).location {
            UpValLocation::Open(stack_idx) => self.stack[stack_idx],
            UpValLocation::Closed(val) => val,
        }
    }

    /// Set an upvalue's value.
    pub fn set_upval_value(&mut self, uv_idx: GcIdx<UpVal>, val: TValue) {
        match self.gc.get_upval(uv_idx).location {
            UpValLocation::Open(stack_idx) => self.stack[stack_idx] = val,
            UpValLocation::Closed(_) => {
                self.gc.get_upval_mut(uv_idx).location = UpValLocation::Closed(val);
            }
        }
    }

    /// Find or create the open upvalue cell for the given stack index.
    pub fn find_or_create_upval(&mut self, stack_idx: usize) -> GcIdx<UpVal> {
        for &(si, uv_idx) in &self.open_upvals {
            if si == stack_idx {
                return uv_idx;
            }
        }
        let uv_idx = self.gc.alloc_upval(UpValLocation::Open(stack_idx));
        self.open_upvals.push((stack_idx, uv_idx));
        self.open_upvals.sort_by(|a, b| b.0.cmp(&a.0));
        uv_idx
    }

    /// Close all open upvalues at or above the given level.
    pub fn close_upvals(&mut self, level: usize) {
        while let Some(&(stack_idx, uv_idx)) = self.open_upvals.first() {
            if stack_idx < level {
                break;
            }
            let val = self.stack[stack_idx];
            self.gc.get_upval_mut(uv_idx).location = UpValLocation::Closed(val);
            self.open_upvals.remove(0);
        }
    }

    /// Value of upvalue `i` of closure `cl`.
    pub fn closure_upval(&self, cl: GcIdx<LuaClosure>, i: usize) -> TValue {
        match self.gc.get_closure(cl).upvals[i] {
            UpvalRef::Value(v) => v,
            UpvalRef::Cell(uv) => self.get_upval_value(uv),
        }
    }

    pub fn set_closure_upval(&mut self, cl: GcIdx<LuaClosure>, i: usize, val: TValue) {
        match self.gc.get_closure(cl).upvals[i] {
            UpvalRef::Value(_) => self.gc.get_closure_mut(cl).upvals[i] = UpvalRef::Value(val),
            UpvalRef::Cell(uv) => self.set_upval_value(uv, val),
        }
    }

    /// The upvalue reference a CAPTURE produces, relative to frame `base`.
    pub fn capture(
        &mut self,
        parent: GcIdx<LuaClosure>,
        base: usize,
        kind: CaptureKind,
        b: u8,
    ) -> UpvalRef {
        match kind {
            CaptureKind::Val => UpvalRef::Value(self.stack[base + b as usize]),
            CaptureKind::Ref => UpvalRef::Cell(self.find_or_create_upval(base + b as usize)),
            CaptureKind::Upval => self.gc.get_closure(parent).upvals[b as usize],
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
