//! Table, global, closure and SETLIST fallbacks.
//!
//! Each operation executes the instruction at `pc` of the innermost frame
//! with the interpreter's full semantics and reports where native code
//! should continue. `base` is the frame's base as a stack offset.

use std::rc::Rc;

use lumen_core::gc::{GcIdx, LuaClosure, UpvalRef};
use lumen_core::table::Table;
use lumen_core::value::TValue;
use lumen_vm::error::{type_error, LuaError};
use lumen_vm::index::{get_table, set_table};
use lumen_vm::limits::LUA_MULTRET;
use lumen_vm::metamethod::{fast_tm, Tm};
use lumen_vm::opcode::{CaptureKind, Insn};
use lumen_vm::proto::Proto;
use lumen_vm::vm::Vm;
use tracing::trace;

pub(crate) const SLOWPATH: &str = "lumen::bridge::slowpath";

/// Where execution continues after a fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextPc {
    /// Keep running native code at this instruction.
    Native(usize),
    /// The frame was handed to the interpreter at its saved pc.
    Interpreter,
}

/// Stop native execution of the innermost frame; the interpreter picks it
/// up at `pc`.
pub fn exit_to_interpreter(vm: &mut Vm, pc: usize) -> NextPc {
    let ci = vm.ci_mut();
    ci.saved_pc = pc;
    ci.set_native(false);
    NextPc::Interpreter
}

/// Continue at `pc`, natively unless single-stepping.
pub(crate) fn resume_at(vm: &mut Vm, pc: usize) -> NextPc {
    if vm.options.single_step {
        exit_to_interpreter(vm, pc)
    } else {
        NextPc::Native(pc)
    }
}

/// The running closure and its prototype.
pub(crate) struct Frame {
    pub cl: GcIdx<LuaClosure>,
    pub proto: Rc<Proto>,
}

impl Frame {
    pub fn current(vm: &Vm) -> Result<Frame, LuaError> {
        let ci = vm.ci();
        let cl = ci
            .closure
            .ok_or_else(|| LuaError::runtime("fallback invoked outside a Luau frame"))?;
        Ok(Frame {
            cl,
            proto: Rc::clone(&vm.protos[ci.proto_idx]),
        })
    }

    pub fn fetch(&self, pc: usize) -> Result<Insn, LuaError> {
        self.proto
            .code
            .get(pc)
            .copied()
            .ok_or_else(|| LuaError::runtime(format!("pc {pc} out of range")))
    }

    pub fn k(&self, k: u32) -> TValue {
        self.proto.k[k as usize]
    }
}

pub(crate) fn mismatch(op: &str, pc: usize, insn: Insn) -> LuaError {
    LuaError::runtime(format!("{op} fallback invoked on {} at pc {pc}", insn.name()))
}

/// `t[key]` for a string key, probing the instruction's predicted hash slot
/// first and updating the prediction on a hit.
fn load_hinted(
    vm: &mut Vm,
    proto: &Proto,
    pc: usize,
    t: GcIdx<Table>,
    key: TValue,
) -> Result<TValue, LuaError> {
    if let Some(sid) = key.as_string_id() {
        let (v, slot) = vm.gc.get_table(t).get_str_hinted(sid, proto.slot_hint(pc));
        if let Some(slot) = slot {
            proto.set_slot_hint(pc, slot);
        }
        if !v.is_nil() {
            return Ok(v);
        }
    }
    trace!(target: SLOWPATH, pc, "hash miss, consulting __index");
    get_table(vm, TValue::from_table(t), key)
}

/// `t[key] = val`: an existing live entry of a writable table is overwritten
/// in place, anything else takes the `__newindex` path.
fn store_hinted(
    vm: &mut Vm,
    proto: &Proto,
    pc: usize,
    t: GcIdx<Table>,
    key: TValue,
    val: TValue,
) -> Result<(), LuaError> {
    if let Some(sid) = key.as_string_id() {
        let table = vm.gc.get_table(t);
        if !table.readonly {
            if let (old, Some(slot)) = table.get_str_hinted(sid, proto.slot_hint(pc)) {
                proto.set_slot_hint(pc, slot);
                if !old.is_nil() {
                    vm.gc.get_table_mut(t).set_slot_value(slot, val);
                    return Ok(());
                }
            }
        }
    }
    trace!(target: SLOWPATH, pc, "no live slot, consulting __newindex");
    set_table(vm, TValue::from_table(t), key, val)
}

/// GETGLOBAL: `R[a] = env[K[k]]`.
pub fn get_global(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::GetGlobal { a, k } = insn else {
        return Err(mismatch("GETGLOBAL", pc, insn));
    };
    let env = vm.gc.get_closure(frame.cl).env;
    let v = load_hinted(vm, &frame.proto, pc, env, frame.k(k))?;
    vm.stack[base + a as usize] = v;
    Ok(resume_at(vm, pc + 1))
}

/// SETGLOBAL: `env[K[k]] = R[a]`.
pub fn set_global(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::SetGlobal { a, k } = insn else {
        return Err(mismatch("SETGLOBAL", pc, insn));
    };
    let env = vm.gc.get_closure(frame.cl).env;
    let val = vm.stack[base + a as usize];
    store_hinted(vm, &frame.proto, pc, env, frame.k(k), val)?;
    Ok(resume_at(vm, pc + 1))
}

/// GETTABLEKS: `R[a] = R[b][K[k]]`.
pub fn get_table_ks(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::GetTableKs { a, b, k } = insn else {
        return Err(mismatch("GETTABLEKS", pc, insn));
    };
    let rb = vm.stack[base + b as usize];
    let key = frame.k(k);
    let v = match rb.as_table_idx() {
        Some(h) => load_hinted(vm, &frame.proto, pc, h, key)?,
        None => get_table(vm, rb, key)?,
    };
    vm.stack[base + a as usize] = v;
    Ok(resume_at(vm, pc + 1))
}

/// SETTABLEKS: `R[b][K[k]] = R[a]`.
pub fn set_table_ks(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::SetTableKs { a, b, k } = insn else {
        return Err(mismatch("SETTABLEKS", pc, insn));
    };
    let rb = vm.stack[base + b as usize];
    let val = vm.stack[base + a as usize];
    let key = frame.k(k);
    match rb.as_table_idx() {
        Some(h) => store_hinted(vm, &frame.proto, pc, h, key, val)?,
        None => set_table(vm, rb, key, val)?,
    }
    Ok(resume_at(vm, pc + 1))
}

/// NAMECALL: `R[a+1] = R[b]; R[a] = R[b][K[k]]`.
///
/// The method is looked up exactly once. Registers are written only after
/// the lookup succeeded, so `b` may alias `a` or `a + 1`. A missing method
/// leaves nil in `R[a]` and is reported by the CALL that follows.
pub fn namecall(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::NameCall { a, b, k } = insn else {
        return Err(mismatch("NAMECALL", pc, insn));
    };
    let rb = vm.stack[base + b as usize];
    let key = frame.k(k);

    let method = if let Some(h) = rb.as_table_idx() {
        load_hinted(vm, &frame.proto, pc, h, key)?
    } else {
        let mt = vm.gc.metatable_of(rb);
        if let Some(handler) = fast_tm(&vm.gc, &vm.mm_names, mt, Tm::NameCall) {
            vm.namecall = key.as_string_id();
            handler
        } else {
            // Shared method tables: look in `__index` when it is a table.
            let index_table = fast_tm(&vm.gc, &vm.mm_names, mt, Tm::Index)
                .and_then(|tm| tm.as_table_idx());
            let found = match (index_table, key.as_string_id()) {
                (Some(h), Some(sid)) => {
                    let (v, slot) = vm.gc.get_table(h).get_str_hinted(sid, frame.proto.slot_hint(pc));
                    if let Some(slot) = slot {
                        frame.proto.set_slot_hint(pc, slot);
                    }
                    v
                }
                _ => TValue::nil(),
            };
            if found.is_nil() {
                trace!(target: SLOWPATH, pc, "method not in __index table, full lookup");
                get_table(vm, rb, key)?
            } else {
                found
            }
        }
    };

    if method.is_nil() {
        vm.ci_mut().missing_method = key.as_string_id().map(|sid| (a as usize, sid));
    }
    vm.stack[base + a as usize + 1] = rb;
    vm.stack[base + a as usize] = method;
    Ok(resume_at(vm, pc + 1))
}

/// NEWCLOSURE: instantiate child prototype `d` and process the CAPTUREs
/// that follow.
pub fn new_closure(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::NewClosure { a, d } = insn else {
        return Err(mismatch("NEWCLOSURE", pc, insn));
    };
    vm.gc_check();
    let child = *frame
        .proto
        .children
        .get(d as usize)
        .ok_or_else(|| LuaError::runtime(format!("no child prototype {d}")))?;
    let nups = vm.protos[child].num_upvalues as usize;
    let env = vm.gc.get_closure(frame.cl).env;
    let ncl = vm.gc.alloc_closure(LuaClosure {
        proto_idx: child,
        env,
        upvals: Vec::with_capacity(nups),
        preload: false,
    });
    vm.stack[base + a as usize] = TValue::from_closure(ncl);

    for ui in 0..nups {
        let (kind, b) = capture_at(&frame, pc + 1 + ui)?;
        let uref = vm.capture(frame.cl, base, kind, b);
        vm.gc.get_closure_mut(ncl).upvals.push(uref);
    }
    Ok(resume_at(vm, pc + 1 + nups))
}

fn capture_at(frame: &Frame, pc: usize) -> Result<(CaptureKind, u8), LuaError> {
    match frame.fetch(pc)? {
        Insn::Capture { kind, b } => Ok((kind, b)),
        other => Err(LuaError::runtime(format!(
            "expected CAPTURE at pc {pc}, found {}",
            other.name()
        ))),
    }
}

/// DUPCLOSURE: reuse closure constant `K[k]` when that is unobservable,
/// otherwise clone it.
///
/// The constant is shared when it was created for the same environment and
/// every capture is raw-equal to what it already holds. A preloaded constant
/// has its upvalues filled in place the first time through.
pub fn dup_closure(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::DupClosure { a, k } = insn else {
        return Err(mismatch("DUPCLOSURE", pc, insn));
    };
    vm.gc_check();
    let kv = frame.k(k);
    let kcl = kv
        .as_closure_idx()
        .ok_or_else(|| LuaError::runtime("DUPCLOSURE constant is not a closure"))?;
    let env = vm.gc.get_closure(frame.cl).env;
    let (kenv, proto_idx, nups) = {
        let c = vm.gc.get_closure(kcl);
        (c.env, c.proto_idx, c.upvals.len())
    };
    let clone_of = |vm: &mut Vm| {
        vm.gc.alloc_closure(LuaClosure {
            proto_idx,
            env,
            upvals: vec![UpvalRef::Value(TValue::nil()); nups],
            preload: false,
        })
    };

    let ra = base + a as usize;
    let mut ncl = if kenv == env { kcl } else { clone_of(vm) };
    vm.stack[ra] = TValue::from_closure(ncl);

    let mut ui = 0;
    while ui < nups {
        let (kind, b) = capture_at(&frame, pc + 1 + ui)?;
        let uv = vm.capture(frame.cl, base, kind, b);
        if ncl == kcl {
            let shared = vm.gc.get_closure(kcl);
            if shared.upvals[ui].raw_eq(&uv) {
                ui += 1;
                continue;
            }
            if !shared.preload {
                trace!(target: SLOWPATH, pc, upvalue = ui, "capture differs, cloning closure");
                ncl = clone_of(vm);
                vm.stack[ra] = TValue::from_closure(ncl);
                ui = 0;
                continue;
            }
        }
        vm.gc.get_closure_mut(ncl).upvals[ui] = uv;
        ui += 1;
    }
    vm.gc.get_closure_mut(ncl).preload = false;
    Ok(resume_at(vm, pc + 1 + nups))
}

/// SETLIST: store `count` registers from `R[b]` into the array part of
/// `R[a]`, starting at array index `index`.
pub fn set_list(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::SetList { a, b, count, index } = insn else {
        return Err(mismatch("SETLIST", pc, insn));
    };
    let rb = base + b as usize;
    let c = if count == LUA_MULTRET {
        let c = vm.top.saturating_sub(rb);
        vm.top = vm.ci().top;
        c
    } else {
        count as usize
    };

    let target = vm.stack[base + a as usize];
    let h = target
        .as_table_idx()
        .ok_or_else(|| type_error(target, "index"))?;
    let first = (index as usize).saturating_sub(1);
    let last = first + c;
    let t = vm.gc.get_table_mut(h);
    if last > t.array_len() {
        trace!(target: SLOWPATH, pc, from = t.array_len(), to = last, "SETLIST grows array part");
        t.resize_array(last);
    }
    for (i, v) in vm.stack[rb..rb + c].iter().enumerate() {
        t.set_array_slot(first + i, *v);
    }
    Ok(resume_at(vm, pc + 1))
}
