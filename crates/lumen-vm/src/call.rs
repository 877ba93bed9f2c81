//! Call machinery shared by the interpreter and the native bridge.

use lumen_core::gc::{GcIdx, LuaClosure, NativeContext, NativeFunction};
use lumen_core::value::TValue;
use tracing::debug;

use crate::callinfo::CallInfo;
use crate::dispatch;
use crate::error::{method_error, type_error, LuaError};
use crate::limits::{LUA_MINSTACK, LUA_MULTRET};
use crate::metamethod::{get_metamethod, Tm};
use crate::vm::Vm;

/// Outcome of [`precall`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreCall {
    /// A Luau frame was pushed and is ready to run.
    Lua,
    /// A native function ran; its results are already in place.
    Native,
}

/// Replace a non-function at `func` by its `__call` handler.
///
/// The original value becomes the first argument; arguments end at `vm.top`.
/// Handlers that are themselves callable objects are followed up to
/// `max_tag_loop` times.
pub fn resolve_call(vm: &mut Vm, func: usize) -> Result<(), LuaError> {
    let mut depth = 0;
    while !vm.stack[func].is_function() {
        if depth >= vm.options.max_tag_loop {
            debug!(target: "lumen::vm::call", limit = vm.options.max_tag_loop, "__call chain cap hit");
            return Err(LuaError::runtime("'__call' chain too long; possible loop"));
        }
        let obj = vm.stack[func];
        let Some(tm) = get_metamethod(&vm.gc, &vm.mm_names, obj, Tm::Call) else {
            return Err(call_error(vm, func, obj));
        };
        vm.check_stack(1)?;
        vm.stack.copy_within(func..vm.top, func + 1);
        vm.top += 1;
        vm.stack[func] = tm;
        depth += 1;
    }
    Ok(())
}

/// Error for calling `obj`. A nil left in `func` by a NAMECALL of the
/// current frame names the missing method.
fn call_error(vm: &mut Vm, func: usize, obj: TValue) -> LuaError {
    let ci = vm.ci_mut();
    if let Some((reg, name)) = ci.missing_method.take() {
        if obj.is_nil() && ci.base + reg == func {
            let name = vm.strings.get_lossy(name).into_owned();
            return method_error(vm.stack[func + 1], &name);
        }
    }
    type_error(obj, "call")
}

/// Start a call to the value at `func` with arguments up to `vm.top`.
pub fn precall(vm: &mut Vm, func: usize, nresults: i32) -> Result<PreCall, LuaError> {
    resolve_call(vm, func)?;
    if vm.call_stack.len() >= vm.options.max_call_depth {
        debug!(target: "lumen::vm::call", depth = vm.call_stack.len(), "frame limit reached");
        return Err(LuaError::StackOverflow);
    }
    let f = vm.stack[func];
    if let Some(cl) = f.as_closure_idx() {
        enter_lua(vm, func, cl, nresults)?;
        Ok(PreCall::Lua)
    } else if let Some(nf) = f.as_native_idx() {
        call_native(vm, func, nf, nresults)?;
        Ok(PreCall::Native)
    } else {
        Err(type_error(f, "call"))
    }
}

/// Push a frame for Luau closure `cl` sitting at `func`.
///
/// Missing fixed parameters are nil-filled. `top` stays at the argument end
/// for vararg functions (PREPVARARGS needs it) and is the frame top otherwise.
pub fn enter_lua(
    vm: &mut Vm,
    func: usize,
    cl: GcIdx<LuaClosure>,
    nresults: i32,
) -> Result<(), LuaError> {
    let proto_idx = vm.gc.get_closure(cl).proto_idx;
    let (num_params, is_vararg, max_stack, has_native) = {
        let p = &vm.protos[proto_idx];
        (
            p.num_params as usize,
            p.is_vararg,
            p.max_stack_size as usize,
            p.native.is_some(),
        )
    };
    let base = func + 1;
    let argtop = vm.top;
    vm.reserve(argtop.max(base) + max_stack)?;

    let mut ci = CallInfo::new(func, base, base + max_stack, nresults);
    ci.closure = Some(cl);
    ci.proto_idx = proto_idx;
    ci.set_native(has_native && vm.options.native_enabled && !vm.options.single_step);

    let param_end = base + num_params;
    for slot in argtop..param_end {
        vm.stack[slot] = TValue::nil();
    }
    vm.top = if is_vararg { argtop.max(param_end) } else { ci.top };
    vm.call_stack.push(ci);
    Ok(())
}

/// Run native function `nf` sitting at `func` and move its results into place.
pub fn call_native(
    vm: &mut Vm,
    func: usize,
    nf: GcIdx<NativeFunction>,
    nresults: i32,
) -> Result<(), LuaError> {
    let n = invoke_native(vm, func, nf, nresults)?;
    let first = vm.top - n;
    poscall(vm, first, n);
    Ok(())
}

/// Push a frame for native function `nf` at `func` and run it.
///
/// The frame stays pushed; its `n` results are the last `n` values below
/// `top`. Returns `n`.
pub fn invoke_native(
    vm: &mut Vm,
    func: usize,
    nf: GcIdx<NativeFunction>,
    nresults: i32,
) -> Result<usize, LuaError> {
    let base = func + 1;
    vm.check_stack(LUA_MINSTACK)?;
    vm.call_stack
        .push(CallInfo::new(func, base, vm.top + LUA_MINSTACK, nresults));

    let f = vm.gc.get_native(nf).func;
    let namecall = vm.namecall.take();
    let top = vm.top;
    let results = {
        let mut ctx = NativeContext {
            args: &vm.stack[base..top],
            gc: &mut vm.gc,
            strings: &mut vm.strings,
            callee: nf,
            namecall,
        };
        f(&mut ctx)?
    };

    let n = results.len();
    vm.check_stack(n)?;
    let first = vm.top;
    vm.stack[first..first + n].copy_from_slice(&results);
    vm.top = first + n;
    Ok(n)
}

/// Finish the innermost frame with `n` results starting at `first`.
///
/// Results are copied down to the function slot, truncated or nil-padded to
/// the frame's expected count, and the frame is popped. `top` ends after the
/// results for multi-return calls and frames entered from the host, and at
/// the caller's frame top otherwise. Returns true when the frame was entered
/// from the host.
pub fn poscall(vm: &mut Vm, first: usize, n: usize) -> bool {
    let Some(ci) = vm.call_stack.pop() else {
        return true;
    };
    let mut res = ci.func;
    let mut vali = first;
    let valend = first + n;

    // In MULTRET context `wanted` starts at -1 and never reaches 0.
    let mut wanted = ci.nresults;
    while wanted != 0 && vali < valend {
        vm.stack[res] = vm.stack[vali];
        res += 1;
        vali += 1;
        wanted -= 1;
    }
    while wanted > 0 {
        vm.stack[res] = TValue::nil();
        res += 1;
        wanted -= 1;
    }

    if ci.is_return() {
        vm.top = res;
        return true;
    }
    vm.top = if ci.nresults == LUA_MULTRET { res } else { vm.ci().top };
    false
}

/// Call the value at `func` with arguments up to `vm.top`, running it to
/// completion. Afterwards the results start at `func`; with a fixed
/// `nresults`, `top` is `func + nresults`.
pub fn call(vm: &mut Vm, func: usize, nresults: i32) -> Result<(), LuaError> {
    if vm.c_calls >= vm.options.max_c_calls {
        debug!(target: "lumen::vm::call", limit = vm.options.max_c_calls, "host call nesting limit");
        return Err(LuaError::CStackOverflow);
    }
    vm.c_calls += 1;
    let result = run_call(vm, func, nresults);
    vm.c_calls -= 1;
    result?;
    if nresults != LUA_MULTRET {
        vm.top = func + nresults as usize;
    }
    Ok(())
}

fn run_call(vm: &mut Vm, func: usize, nresults: i32) -> Result<(), LuaError> {
    if precall(vm, func, nresults)? == PreCall::Lua {
        vm.ci_mut().set_return(true);
        dispatch::execute(vm)?;
    }
    Ok(())
}

/// Call `f` with `args` and collect every result.
pub fn call_value(vm: &mut Vm, f: TValue, args: &[TValue]) -> Result<Vec<TValue>, LuaError> {
    let func = vm.top;
    vm.check_stack(args.len() + 1)?;
    vm.stack[func] = f;
    vm.stack[func + 1..func + 1 + args.len()].copy_from_slice(args);
    vm.top = func + 1 + args.len();
    call(vm, func, LUA_MULTRET)?;
    let results = vm.stack[func..vm.top].to_vec();
    vm.top = func;
    Ok(results)
}

/// Call metamethod `f(a, b)` and return its first result.
pub fn call_tm_res(vm: &mut Vm, f: TValue, a: TValue, b: TValue) -> Result<TValue, LuaError> {
    let func = vm.top;
    vm.check_stack(3)?;
    vm.stack[func] = f;
    vm.stack[func + 1] = a;
    vm.stack[func + 2] = b;
    vm.top = func + 3;
    call(vm, func, 1)?;
    let res = vm.stack[func];
    vm.top = func;
    Ok(res)
}

/// Call metamethod `f(a, b, c)` discarding results.
pub fn call_tm(vm: &mut Vm, f: TValue, a: TValue, b: TValue, c: TValue) -> Result<(), LuaError> {
    let func = vm.top;
    vm.check_stack(4)?;
    vm.stack[func] = f;
    vm.stack[func + 1] = a;
    vm.stack[func + 2] = b;
    vm.stack[func + 3] = c;
    vm.top = func + 4;
    call(vm, func, 0)?;
    vm.top = func;
    Ok(())
}

/// Protected call: on error every frame, open upvalue and counter above the
/// boundary is rolled back before the error is returned.
pub fn pcall(vm: &mut Vm, f: TValue, args: &[TValue]) -> Result<Vec<TValue>, LuaError> {
    let depth = vm.call_stack.len();
    let top = vm.top;
    let c_calls = vm.c_calls;
    match call_value(vm, f, args) {
        Ok(results) => Ok(results),
        Err(e) => {
            vm.close_upvals(top);
            vm.call_stack.truncate(depth);
            vm.top = top;
            vm.c_calls = c_calls;
            vm.namecall = None;
            vm.pending_error = None;
            Err(e)
        }
    }
}
