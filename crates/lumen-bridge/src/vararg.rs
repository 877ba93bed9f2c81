//! GETVARARGS and PREPVARARGS.
//!
//! A vararg frame keeps its extra arguments between the function slot and
//! the (moved) fixed parameters: after PREPVARARGS the `n` varargs sit at
//! `base - n .. base`.

use lumen_core::value::TValue;
use lumen_vm::error::LuaError;
use lumen_vm::limits::LUA_MULTRET;
use lumen_vm::opcode::Insn;
use lumen_vm::vm::Vm;
use tracing::trace;

use crate::fallback::{mismatch, resume_at, Frame, NextPc, SLOWPATH};

/// Number of varargs of the innermost frame, whose base is `base`.
pub fn vararg_count(vm: &Vm, base: usize, num_params: usize) -> usize {
    (base - vm.ci().func - 1).saturating_sub(num_params)
}

/// GETVARARGS: copy the varargs to `R[a]..`.
///
/// `count == LUA_MULTRET` copies all of them and sets `top` after the last;
/// otherwise exactly `count` registers are written, nil-padded.
pub fn get_varargs(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::GetVarArgs { a, count } = insn else {
        return Err(mismatch("GETVARARGS", pc, insn));
    };
    let n = vararg_count(vm, base, frame.proto.num_params as usize);
    let ra = base + a as usize;

    if count == LUA_MULTRET {
        vm.reserve(ra + n)?;
        vm.stack.copy_within(base - n..base, ra);
        vm.top = ra + n;
    } else {
        let wanted = count as usize;
        let copied = wanted.min(n);
        vm.stack.copy_within(base - n..base - n + copied, ra);
        vm.stack[ra + copied..ra + wanted].fill(TValue::nil());
    }
    Ok(resume_at(vm, pc + 1))
}

/// PREPVARARGS: move the fixed parameters above the passed arguments and
/// re-base the frame there.
///
/// The frame's base changes; native code must reload it from the frame
/// afterwards.
pub fn prep_varargs(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::PrepVarArgs { num_params } = insn else {
        return Err(mismatch("PREPVARARGS", pc, insn));
    };
    let num_params = num_params as usize;
    let max_stack = frame.proto.max_stack_size as usize;
    vm.check_stack(max_stack + num_params)?;

    let fixed = base;
    let new_base = vm.top;
    vm.stack.copy_within(fixed..fixed + num_params, new_base);
    vm.stack[fixed..fixed + num_params].fill(TValue::nil());
    trace!(target: SLOWPATH, pc, from = fixed, to = new_base, "frame re-based for varargs");

    let ci = vm.ci_mut();
    ci.base = new_base;
    ci.top = new_base + max_stack;
    vm.top = new_base + max_stack;
    Ok(resume_at(vm, pc + 1))
}
