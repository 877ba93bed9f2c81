//! Reference interpreter loop.

use std::rc::Rc;

use lumen_core::gc::{LuaClosure, UpvalRef};
use lumen_core::table::IterCursor;
use lumen_core::value::TValue;
use tracing::trace;

use crate::call::{self, PreCall};
use crate::error::{arith_error, type_error, LuaError};
use crate::index::{get_table, set_table};
use crate::limits::LUA_MULTRET;
use crate::metamethod::{fast_tm, Tm};
use crate::opcode::{jump_target, CaptureKind, Insn};
use crate::proto::{NativeEntry, NATIVE_DONE};
use crate::vm::Vm;

/// Run the innermost frame, and every frame it calls, until a frame entered
/// from the host returns.
///
/// Frames flagged native are handed to their prototype's entry point; the
/// interpreter picks up again wherever the native code leaves off.
pub fn execute(vm: &mut Vm) -> Result<(), LuaError> {
    'reentry: loop {
        let ci_idx = vm.call_stack.len() - 1;
        let (closure, proto_idx, native) = {
            let ci = &vm.call_stack[ci_idx];
            (ci.closure, ci.proto_idx, ci.is_native())
        };
        let Some(cl_idx) = closure else {
            return Err(LuaError::runtime("interpreter entered without a Luau frame"));
        };
        let proto = Rc::clone(&vm.protos[proto_idx]);

        if native {
            match proto.native {
                Some(entry) if vm.options.native_enabled => {
                    if enter_native(vm, entry)? {
                        continue 'reentry;
                    }
                    return Ok(());
                }
                _ => vm.call_stack[ci_idx].set_native(false),
            }
        }

        let mut base = vm.call_stack[ci_idx].base;
        let mut pc = vm.call_stack[ci_idx].saved_pc;

        macro_rules! reg {
            ($r:expr) => {
                vm.stack[base + $r as usize]
            };
        }

        loop {
            let cur = pc;
            let Some(&insn) = proto.code.get(cur) else {
                return Err(LuaError::runtime(format!("pc {cur} out of range")));
            };
            pc = cur + 1;

            match insn {
                Insn::Nop => {}
                Insn::Move { a, b } => reg!(a) = reg!(b),
                Insn::LoadNil { a } => reg!(a) = TValue::nil(),
                Insn::LoadB { a, value, skip } => {
                    reg!(a) = TValue::from_bool(value);
                    pc += skip as usize;
                }
                Insn::LoadN { a, n } => reg!(a) = TValue::from_number(n as f64),
                Insn::LoadK { a, k } => reg!(a) = proto.k[k as usize],

                Insn::GetGlobal { a, k } => {
                    let env = vm.gc.get_closure(cl_idx).env;
                    let key = proto.k[k as usize];
                    let v = vm.gc.get_table(env).raw_get(key);
                    let v = if v.is_nil() {
                        get_table(vm, TValue::from_table(env), key)?
                    } else {
                        v
                    };
                    reg!(a) = v;
                }
                Insn::SetGlobal { a, k } => {
                    let env = vm.gc.get_closure(cl_idx).env;
                    let val = reg!(a);
                    set_table(vm, TValue::from_table(env), proto.k[k as usize], val)?;
                }
                Insn::GetUpval { a, u } => reg!(a) = vm.closure_upval(cl_idx, u as usize),
                Insn::SetUpval { a, u } => {
                    let val = reg!(a);
                    vm.set_closure_upval(cl_idx, u as usize, val);
                }
                Insn::CloseUpvals { a } => vm.close_upvals(base + a as usize),

                Insn::GetTable { a, b, c } => {
                    let (t, key) = (reg!(b), reg!(c));
                    reg!(a) = get_table(vm, t, key)?;
                }
                Insn::SetTable { a, b, c } => {
                    let (t, key, val) = (reg!(b), reg!(c), reg!(a));
                    set_table(vm, t, key, val)?;
                }
                Insn::GetTableKs { a, b, k } => {
                    let t = reg!(b);
                    let key = proto.k[k as usize];
                    reg!(a) = get_table(vm, t, key)?;
                }
                Insn::SetTableKs { a, b, k } => {
                    let (t, val) = (reg!(b), reg!(a));
                    set_table(vm, t, proto.k[k as usize], val)?;
                }
                Insn::GetTableN { a, b, n } => {
                    let t = reg!(b);
                    reg!(a) = get_table(vm, t, TValue::from_number(n as f64 + 1.0))?;
                }
                Insn::SetTableN { a, b, n } => {
                    let (t, val) = (reg!(b), reg!(a));
                    set_table(vm, t, TValue::from_number(n as f64 + 1.0), val)?;
                }

                Insn::NewClosure { a, d } => {
                    vm.gc_check();
                    let child = proto.children[d as usize];
                    let nups = vm.protos[child].num_upvalues as usize;
                    let env = vm.gc.get_closure(cl_idx).env;
                    let ncl = vm.gc.alloc_closure(LuaClosure {
                        proto_idx: child,
                        env,
                        upvals: Vec::with_capacity(nups),
                        preload: false,
                    });
                    // Stored before capturing so a Val capture of `a` sees it.
                    reg!(a) = TValue::from_closure(ncl);
                    for _ in 0..nups {
                        let Some(&Insn::Capture { kind, b }) = proto.code.get(pc) else {
                            return Err(LuaError::runtime("NEWCLOSURE is missing a CAPTURE"));
                        };
                        pc += 1;
                        let uref = vm.capture(cl_idx, base, kind, b);
                        vm.gc.get_closure_mut(ncl).upvals.push(uref);
                    }
                }
                Insn::DupClosure { a, k } => {
                    vm.gc_check();
                    let Some(kcl) = proto.k[k as usize].as_closure_idx() else {
                        return Err(LuaError::runtime("DUPCLOSURE constant is not a closure"));
                    };
                    let env = vm.gc.get_closure(cl_idx).env;
                    let (kenv, kproto, nups) = {
                        let c = vm.gc.get_closure(kcl);
                        (c.env, c.proto_idx, c.upvals.len())
                    };
                    let fresh = |vm: &mut Vm| {
                        vm.gc.alloc_closure(LuaClosure {
                            proto_idx: kproto,
                            env,
                            upvals: vec![UpvalRef::Value(TValue::nil()); nups],
                            preload: false,
                        })
                    };
                    let mut ncl = if kenv == env { kcl } else { fresh(vm) };
                    reg!(a) = TValue::from_closure(ncl);

                    let mut ui = 0;
                    while ui < nups {
                        let Some(&Insn::Capture { kind, b }) = proto.code.get(pc + ui) else {
                            return Err(LuaError::runtime("DUPCLOSURE is missing a CAPTURE"));
                        };
                        let uv = match kind {
                            CaptureKind::Val => UpvalRef::Value(reg!(b)),
                            _ => vm.capture(cl_idx, base, kind, b),
                        };
                        if ncl == kcl {
                            let shared = vm.gc.get_closure(kcl);
                            if shared.upvals[ui].raw_eq(&uv) {
                                ui += 1;
                                continue;
                            }
                            if !shared.preload {
                                ncl = fresh(vm);
                                reg!(a) = TValue::from_closure(ncl);
                                ui = 0;
                                continue;
                            }
                        }
                        vm.gc.get_closure_mut(ncl).upvals[ui] = uv;
                        ui += 1;
                    }
                    vm.gc.get_closure_mut(ncl).preload = false;
                    pc += nups;
                }
                Insn::Capture { .. } => {
                    return Err(LuaError::runtime("CAPTURE outside closure creation"));
                }

                Insn::NameCall { a, b, k } => {
                    let rb = reg!(b);
                    let key = proto.k[k as usize];
                    let namecall = if rb.is_table() {
                        None
                    } else {
                        let mt = vm.gc.metatable_of(rb);
                        fast_tm(&vm.gc, &vm.mm_names, mt, Tm::NameCall)
                    };
                    let method = match namecall {
                        Some(handler) => {
                            vm.namecall = key.as_string_id();
                            handler
                        }
                        None => get_table(vm, rb, key)?,
                    };
                    if method.is_nil() {
                        vm.call_stack[ci_idx].missing_method =
                            key.as_string_id().map(|s| (a as usize, s));
                    }
                    reg!(a + 1) = rb;
                    reg!(a) = method;
                }
                Insn::Call { a, nargs, nresults } => {
                    let ra = base + a as usize;
                    if nargs != LUA_MULTRET {
                        vm.top = ra + 1 + nargs as usize;
                    }
                    vm.call_stack[ci_idx].saved_pc = pc;
                    if call::precall(vm, ra, nresults)? == PreCall::Lua {
                        continue 'reentry;
                    }
                }
                Insn::Return { a, count } => {
                    let ra = base + a as usize;
                    let n = if count == LUA_MULTRET {
                        vm.top.saturating_sub(ra)
                    } else {
                        count as usize
                    };
                    if call::poscall(vm, ra, n) {
                        return Ok(());
                    }
                    continue 'reentry;
                }

                Insn::Jump { d } => pc = jump_target(cur, d),
                Insn::JumpIf { a, d } => {
                    if reg!(a).is_truthy() {
                        pc = jump_target(cur, d);
                    }
                }
                Insn::JumpIfNot { a, d } => {
                    if reg!(a).is_falsy() {
                        pc = jump_target(cur, d);
                    }
                }

                Insn::Add { a, b, c } => reg!(a) = arith(reg!(b), reg!(c), |x, y| x + y)?,
                Insn::Sub { a, b, c } => reg!(a) = arith(reg!(b), reg!(c), |x, y| x - y)?,
                Insn::AddK { a, b, k } => {
                    reg!(a) = arith(reg!(b), proto.k[k as usize], |x, y| x + y)?
                }

                Insn::NewTable { a, array_size, hash_size } => {
                    vm.gc_check();
                    let t = vm.gc.alloc_table(array_size as usize, hash_size as usize);
                    reg!(a) = TValue::from_table(t);
                }
                Insn::SetList { a, b, count, index } => {
                    let rb = base + b as usize;
                    let c = if count == LUA_MULTRET {
                        let c = vm.top.saturating_sub(rb);
                        vm.top = vm.call_stack[ci_idx].top;
                        c
                    } else {
                        count as usize
                    };
                    let target = reg!(a);
                    let Some(h) = target.as_table_idx() else {
                        return Err(type_error(target, "index"));
                    };
                    let start = (index as usize).saturating_sub(1);
                    let t = vm.gc.get_table_mut(h);
                    if start + c > t.array_len() {
                        t.resize_array(start + c);
                    }
                    for i in 0..c {
                        t.set_array_slot(start + i, vm.stack[rb + i]);
                    }
                }

                Insn::ForGPrep { a, d } => {
                    let ra = base + a as usize;
                    let obj = vm.stack[ra];
                    if !obj.is_function() {
                        let mt = if obj.is_table() || obj.as_userdata_idx().is_some() {
                            vm.gc.metatable_of(obj)
                        } else {
                            None
                        };
                        if let Some(iter) = fast_tm(&vm.gc, &vm.mm_names, mt, Tm::Iter) {
                            vm.stack[ra + 1] = obj;
                            vm.stack[ra] = iter;
                            vm.top = ra + 2;
                            call::call(vm, ra, 3)?;
                            vm.top = vm.call_stack[ci_idx].top;
                            if vm.stack[ra].is_nil() {
                                return Err(type_error(TValue::nil(), "call"));
                            }
                        } else if fast_tm(&vm.gc, &vm.mm_names, mt, Tm::Call).is_some() {
                            // called by FORGLOOP
                        } else if let Some(h) = obj.as_table_idx() {
                            let array_only = !vm.gc.get_table(h).has_live_nodes();
                            vm.stack[ra + 1] = obj;
                            vm.stack[ra + 2] = IterCursor::start(array_only).to_tvalue();
                            vm.stack[ra] = TValue::nil();
                        } else {
                            return Err(type_error(obj, "iterate over"));
                        }
                    }
                    pc = jump_target(cur, d);
                }
                Insn::ForGPrepNext { a, d } => {
                    let ra = base + a as usize;
                    let (f, state, ctl) = (vm.stack[ra], vm.stack[ra + 1], vm.stack[ra + 2]);
                    match state.as_table_idx() {
                        Some(h) if f.raw_equal(&vm.builtin_next) && ctl.is_nil() => {
                            let array_only = !vm.gc.get_table(h).has_live_nodes();
                            vm.stack[ra] = TValue::nil();
                            vm.stack[ra + 2] = IterCursor::start(array_only).to_tvalue();
                        }
                        _ if !f.is_function() => return Err(type_error(f, "iterate over")),
                        _ => {}
                    }
                    pc = jump_target(cur, d);
                }
                Insn::ForGPrepINext { a, d } => {
                    let ra = base + a as usize;
                    let (f, state, ctl) = (vm.stack[ra], vm.stack[ra + 1], vm.stack[ra + 2]);
                    if f.raw_equal(&vm.builtin_inext) && state.is_table() && ctl.as_number() == Some(0.0) {
                        vm.stack[ra] = TValue::nil();
                        vm.stack[ra + 2] = IterCursor::start(true).to_tvalue();
                    } else if !f.is_function() {
                        return Err(type_error(f, "iterate over"));
                    }
                    pc = jump_target(cur, d);
                }
                Insn::ForGLoop { a, d, nvars, ipairs } => {
                    let ra = base + a as usize;
                    let builtin = match (vm.stack[ra].is_nil(), vm.stack[ra + 1].as_table_idx()) {
                        (true, Some(h)) => IterCursor::from_tvalue(vm.stack[ra + 2]).map(|c| (h, c)),
                        _ => None,
                    };
                    if let Some((h, cursor)) = builtin {
                        for i in 2..nvars as usize {
                            vm.stack[ra + 3 + i] = TValue::nil();
                        }
                        let t = vm.gc.get_table(h);
                        let index = cursor.index as usize;
                        let stop = ipairs
                            && t.array_values().get(index).map_or(true, |v| v.is_nil());
                        let step = if stop { None } else { t.next_from(index, cursor.array_only) };
                        if let Some((next, key, val)) = step {
                            let cursor = IterCursor {
                                index: next as u32,
                                array_only: cursor.array_only,
                            };
                            vm.stack[ra + 2] = cursor.to_tvalue();
                            vm.stack[ra + 3] = key;
                            vm.stack[ra + 4] = val;
                            pc = jump_target(cur, d);
                        }
                    } else {
                        vm.stack[ra + 5] = vm.stack[ra + 2];
                        vm.stack[ra + 4] = vm.stack[ra + 1];
                        vm.stack[ra + 3] = vm.stack[ra];
                        vm.top = ra + 6;
                        call::call(vm, ra + 3, nvars as i32)?;
                        vm.top = vm.call_stack[ci_idx].top;
                        vm.stack[ra + 2] = vm.stack[ra + 3];
                        if !vm.stack[ra + 3].is_nil() {
                            pc = jump_target(cur, d);
                        }
                    }
                }

                Insn::GetVarArgs { a, count } => {
                    let func = vm.call_stack[ci_idx].func;
                    let n = (base - func - 1).saturating_sub(proto.num_params as usize);
                    let ra = base + a as usize;
                    if count == LUA_MULTRET {
                        vm.reserve(ra + n)?;
                        for j in 0..n {
                            vm.stack[ra + j] = vm.stack[base - n + j];
                        }
                        vm.top = ra + n;
                    } else {
                        for j in 0..count as usize {
                            vm.stack[ra + j] = if j < n {
                                vm.stack[base - n + j]
                            } else {
                                TValue::nil()
                            };
                        }
                    }
                }
                Insn::PrepVarArgs { num_params } => {
                    let num_params = num_params as usize;
                    let max_stack = proto.max_stack_size as usize;
                    vm.check_stack(max_stack + num_params)?;
                    let fixed = base;
                    let new_base = vm.top;
                    for i in 0..num_params {
                        vm.stack[new_base + i] = vm.stack[fixed + i];
                        vm.stack[fixed + i] = TValue::nil();
                    }
                    let ci = &mut vm.call_stack[ci_idx];
                    ci.base = new_base;
                    ci.top = new_base + max_stack;
                    base = new_base;
                    vm.top = ci.top;
                }
            }
        }
    }
}

fn arith(a: TValue, b: TValue, op: impl Fn(f64, f64) -> f64) -> Result<TValue, LuaError> {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok(TValue::from_number(op(x, y))),
        _ => Err(arith_error(a, b)),
    }
}

/// Hand the innermost frame to native code. Returns true when the
/// interpreter should continue with the innermost frame.
fn enter_native(vm: &mut Vm, entry: NativeEntry) -> Result<bool, LuaError> {
    let base = vm.ci().base;
    trace!(target: "lumen::vm::native", base, "entering native code");
    // SAFETY: `vm` is a live, exclusive context for the duration of the call
    // and entry points only touch it through that pointer.
    let code = unsafe { entry(vm as *mut Vm, base) };
    match code {
        NATIVE_DONE => Ok(false),
        c if c > 0 => Ok(true),
        _ => Err(vm.pending_error.take().unwrap_or_else(|| {
            LuaError::runtime("native code failed without recording an error")
        })),
    }
}
