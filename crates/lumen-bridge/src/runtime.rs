//! `extern "C"` entry points for generated code.
//!
//! Fallback shims take `(vm, pc, base)` and return the pc to continue at, or
//! [`SIDE_EXIT`]. A side exit means native execution of the frame must stop:
//! the generated code returns `lumen_rt_exit(vm, SIDE_EXIT)` from its entry
//! point, which tells the dispatch loop whether an error is pending or the
//! interpreter should take over.
//!
//! All shims share one safety contract: `vm` must be a valid, exclusive
//! pointer to a live `Vm`, and `pc`/`base` must describe the innermost
//! frame.

use lumen_core::table::IterCursor;
use lumen_core::value::TValue;
use lumen_vm::error::LuaError;
use lumen_vm::proto::{NATIVE_CONTINUE, NATIVE_DONE, NATIVE_ERROR};
use lumen_vm::vm::Vm;

use crate::call::{self, CallTarget, Resume};
use crate::dispatch;
use crate::fallback::{self, NextPc};
use crate::{forg, vararg};

/// Returned by a shim when native code must stop running the frame.
pub const SIDE_EXIT: i64 = -1;

/// Record `err` for the dispatch loop.
fn raise(vm: &mut Vm, err: LuaError) -> i64 {
    vm.pending_error = Some(err);
    SIDE_EXIT
}

fn next_pc_code(vm: &mut Vm, r: Result<NextPc, LuaError>) -> i64 {
    match r {
        Ok(NextPc::Native(pc)) => pc as i64,
        Ok(NextPc::Interpreter) => SIDE_EXIT,
        Err(e) => raise(vm, e),
    }
}

/// The code an entry point returns after a side exit.
pub fn side_exit_code(vm: &Vm) -> i64 {
    if vm.pending_error.is_some() {
        NATIVE_ERROR
    } else {
        NATIVE_CONTINUE
    }
}

/// Leave native code. A non-negative `pc` hands the frame to the interpreter
/// at that instruction; [`SIDE_EXIT`] forwards the state a shim left behind.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_exit(vm: *mut Vm, pc: i64) -> i64 {
    let vm = &mut *vm;
    if pc < 0 {
        return side_exit_code(vm);
    }
    fallback::exit_to_interpreter(vm, pc as usize);
    NATIVE_CONTINUE
}

/// Run the fallback of whatever instruction is at `pc`.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_fallback(vm: *mut Vm, pc: u64, base: u64) -> i64 {
    let vm = &mut *vm;
    let r = dispatch::run_at(vm, pc as usize, base as usize);
    next_pc_code(vm, r)
}

macro_rules! fallback_shims {
    ($($name:ident => $op:path;)*) => {
        $(
            /// # Safety
            /// See the module documentation.
            #[no_mangle]
            pub unsafe extern "C" fn $name(vm: *mut Vm, pc: u64, base: u64) -> i64 {
                let vm = &mut *vm;
                let r = $op(vm, pc as usize, base as usize);
                next_pc_code(vm, r)
            }
        )*
    };
}

fallback_shims! {
    lumen_rt_get_global => fallback::get_global;
    lumen_rt_set_global => fallback::set_global;
    lumen_rt_get_table_ks => fallback::get_table_ks;
    lumen_rt_set_table_ks => fallback::set_table_ks;
    lumen_rt_namecall => fallback::namecall;
    lumen_rt_new_closure => fallback::new_closure;
    lumen_rt_dup_closure => fallback::dup_closure;
    lumen_rt_set_list => fallback::set_list;
    lumen_rt_get_varargs => vararg::get_varargs;
    lumen_rt_prep_varargs => vararg::prep_varargs;
    lumen_rt_forg_prep => forg::forg_prep;
    lumen_rt_forg_prep_next => forg::forg_prep_next;
    lumen_rt_forg_prep_inext => forg::forg_prep_inext;
    lumen_rt_forg_loop => forg::forg_loop;
}

/// One builtin table-iteration step. Returns 1 on a hit, 0 at the end.
///
/// # Safety
/// See the module documentation. `table_bits` must be a table value and
/// `cursor_bits` an iteration cursor.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_forg_loop_table_iter(
    vm: *mut Vm,
    table_bits: u64,
    cursor_bits: u64,
    ra: u64,
) -> i64 {
    let vm = &mut *vm;
    let (Some(h), Some(cursor)) = (
        TValue::from_raw_bits(table_bits).as_table_idx(),
        IterCursor::from_tvalue(TValue::from_raw_bits(cursor_bits)),
    ) else {
        return 0;
    };
    forg::forg_loop_table_iter(vm, h, cursor, ra as usize) as i64
}

/// Like `lumen_rt_forg_loop_table_iter`, hash part only.
///
/// # Safety
/// See `lumen_rt_forg_loop_table_iter`.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_forg_loop_node_iter(
    vm: *mut Vm,
    table_bits: u64,
    cursor_bits: u64,
    ra: u64,
) -> i64 {
    let vm = &mut *vm;
    let (Some(h), Some(cursor)) = (
        TValue::from_raw_bits(table_bits).as_table_idx(),
        IterCursor::from_tvalue(TValue::from_raw_bits(cursor_bits)),
    ) else {
        return 0;
    };
    forg::forg_loop_node_iter(vm, h, cursor, ra as usize) as i64
}

/// One step of a loop over a callable. Returns 1 to run the body again,
/// 0 when done, [`SIDE_EXIT`] on error.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_forg_loop_non_table(vm: *mut Vm, ra: u64, nvars: u64) -> i64 {
    let vm = &mut *vm;
    match forg::forg_loop_non_table_fallback(vm, ra as usize, nvars as u8) {
        Ok(more) => more as i64,
        Err(e) => raise(vm, e),
    }
}

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_forg_prep_xnext(vm: *mut Vm, ra: u64, pc: u64) -> i64 {
    let vm = &mut *vm;
    match forg::forg_prep_xnext_fallback(vm, ra as usize, pc as usize) {
        Ok(()) => 0,
        Err(e) => raise(vm, e),
    }
}

/// Call prologue. Returns 1 when a Luau frame was pushed, 0 when a native
/// function already ran, [`SIDE_EXIT`] on error.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_call_prolog(
    vm: *mut Vm,
    ra: u64,
    argtop: u64,
    nresults: i64,
) -> i64 {
    let vm = &mut *vm;
    match call::call_prolog(vm, ra as usize, argtop as usize, nresults as i32) {
        Ok(Some(_)) => 1,
        Ok(None) => 0,
        Err(e) => raise(vm, e),
    }
}

/// # Safety
/// See the module documentation. The innermost frame must be a native
/// function's frame with `n` results below `top`.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_call_epilog_c(vm: *mut Vm, nresults: i64, n: u64) {
    let vm = &mut *vm;
    call::call_epilog_c(vm, nresults as i32, n as usize);
}

/// CALL at `pc`. Returns `pc + 1` when the callee already ran and
/// [`SIDE_EXIT`] otherwise; the dispatch loop then runs the new frame.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_call_fallback(vm: *mut Vm, pc: u64, base: u64) -> i64 {
    let vm = &mut *vm;
    match call::call_fallback(vm, pc as usize, base as usize) {
        Ok(CallTarget::Handled) => pc as i64 + 1,
        Ok(CallTarget::Native | CallTarget::Interpreter) => SIDE_EXIT,
        Err(e) => raise(vm, e),
    }
}

/// RETURN at `pc`. The result is what the entry point returns.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_return_fallback(vm: *mut Vm, pc: u64, base: u64) -> i64 {
    let vm = &mut *vm;
    match call::return_at(vm, pc as usize, base as usize) {
        Ok(Resume::Host) => NATIVE_DONE,
        Ok(Resume::NativeCaller | Resume::Interpreter) => NATIVE_CONTINUE,
        Err(e) => {
            vm.pending_error = Some(e);
            NATIVE_ERROR
        }
    }
}

/// Record the resume point of the innermost frame.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_save_pc(vm: *mut Vm, pc: u64) {
    let vm = &mut *vm;
    vm.ci_mut().saved_pc = pc as usize;
}

/// Current base of the innermost frame; PREPVARARGS moves it.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_frame_base(vm: *mut Vm) -> u64 {
    let vm = &*vm;
    vm.ci().base as u64
}

/// Raw bits of `stack[idx]`, nil when out of range.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_get_slot(vm: *mut Vm, idx: u64) -> u64 {
    let vm = &*vm;
    vm.stack
        .get(idx as usize)
        .copied()
        .unwrap_or_else(TValue::nil)
        .raw_bits()
}

/// # Safety
/// See the module documentation. `idx` must be below the frame top.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_set_slot(vm: *mut Vm, idx: u64, bits: u64) {
    let vm = &mut *vm;
    vm.stack[idx as usize] = TValue::from_raw_bits(bits);
}

/// Collection safe point. Native code calls this before allocating a table
/// inline; every live value must already be in a stack slot.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lumen_rt_gc_check(vm: *mut Vm) {
    let vm = &mut *vm;
    vm.gc_check();
}
