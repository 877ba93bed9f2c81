//! Frame transitions between native code and the interpreter.

use lumen_core::gc::{GcIdx, LuaClosure};
use lumen_core::value::TValue;
use lumen_vm::call::{enter_lua, invoke_native, poscall, precall, resolve_call, PreCall};
use lumen_vm::error::{type_error, LuaError};
use lumen_vm::limits::LUA_MULTRET;
use lumen_vm::opcode::Insn;
use lumen_vm::vm::Vm;
use tracing::trace;

use crate::fallback::{mismatch, Frame, SLOWPATH};

/// Outcome of [`call_fallback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallTarget {
    /// A frame for a callee with native code was pushed.
    Native,
    /// A frame was pushed that the interpreter has to run.
    Interpreter,
    /// A native function already ran; continue after the CALL.
    Handled,
}

/// Outcome of [`return_fallback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// The caller runs native code; continue it at its saved pc.
    NativeCaller,
    /// The caller is interpreted.
    Interpreter,
    /// The frame was entered from the host, which now has the results.
    Host,
}

/// Call prologue for a value at `ra` with arguments up to `argtop`.
///
/// Non-functions are replaced by their `__call` handler with the original
/// value as first argument. For a Luau closure a frame is pushed and the
/// closure is returned; the caller's saved pc must already be set. A native
/// function is run to completion, epilogue included, and `None` is returned.
pub fn call_prolog(
    vm: &mut Vm,
    ra: usize,
    argtop: usize,
    nresults: i32,
) -> Result<Option<GcIdx<LuaClosure>>, LuaError> {
    vm.top = argtop;
    resolve_call(vm, ra)?;
    if vm.call_stack.len() >= vm.options.max_call_depth {
        return Err(LuaError::StackOverflow);
    }
    let f = vm.stack[ra];
    if let Some(cl) = f.as_closure_idx() {
        enter_lua(vm, ra, cl, nresults)?;
        Ok(Some(cl))
    } else if let Some(nf) = f.as_native_idx() {
        let n = invoke_native(vm, ra, nf, nresults)?;
        call_epilog_c(vm, nresults, n);
        Ok(None)
    } else {
        Err(type_error(f, "call"))
    }
}

/// Call epilogue for a native function whose `n` results end at `top`.
///
/// Moves the results to the function slot, truncated or nil-padded to
/// `nresults`, and pops the frame. `top` is left after the results for
/// `LUA_MULTRET` and at the caller's frame top otherwise.
pub fn call_epilog_c(vm: &mut Vm, nresults: i32, n: usize) {
    let Some(ci) = vm.call_stack.pop() else {
        return;
    };
    let mut res = ci.func;
    let valend = vm.top;
    let mut vali = valend - n;

    let mut wanted = nresults;
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
    vm.top = if nresults == LUA_MULTRET { res } else { vm.ci().top };
}

/// CALL: perform the call at `pc` of the innermost frame.
///
/// The caller resumes at `pc + 1` once the callee returns.
pub fn call_fallback(vm: &mut Vm, pc: usize, base: usize) -> Result<CallTarget, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::Call { a, nargs, nresults } = insn else {
        return Err(mismatch("CALL", pc, insn));
    };
    let ra = base + a as usize;
    if nargs != LUA_MULTRET {
        vm.top = ra + 1 + nargs as usize;
    }
    vm.ci_mut().saved_pc = pc + 1;

    let outcome = match precall(vm, ra, nresults)? {
        PreCall::Native => CallTarget::Handled,
        PreCall::Lua if vm.ci().is_native() => CallTarget::Native,
        PreCall::Lua => CallTarget::Interpreter,
    };
    trace!(target: SLOWPATH, pc, ?outcome, "call fallback");
    Ok(outcome)
}

/// RETURN: finish the innermost frame with the values `ra..valend`.
pub fn return_fallback(vm: &mut Vm, ra: usize, valend: usize) -> Resume {
    if poscall(vm, ra, valend - ra) {
        return Resume::Host;
    }
    if vm.ci().is_native() {
        Resume::NativeCaller
    } else {
        Resume::Interpreter
    }
}

/// Decode the RETURN at `pc` and run [`return_fallback`].
pub fn return_at(vm: &mut Vm, pc: usize, base: usize) -> Result<Resume, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::Return { a, count } = insn else {
        return Err(mismatch("RETURN", pc, insn));
    };
    let ra = base + a as usize;
    let valend = if count == LUA_MULTRET {
        vm.top.max(ra)
    } else {
        ra + count as usize
    };
    Ok(return_fallback(vm, ra, valend))
}
