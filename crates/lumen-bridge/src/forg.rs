//! Generic-for protocol.
//!
//! FORGPREP decides once how a loop iterates. A plain table gets the builtin
//! marker (`ra = nil`, `ra+1 = table`, `ra+2 = cursor`); everything else keeps
//! a callable in `ra` and goes through the call protocol on every step. The
//! cursor records whether the traversal is confined to the array part, so a
//! loop never changes strategy halfway.

use lumen_core::gc::GcIdx;
use lumen_core::table::{IterCursor, Table};
use lumen_core::value::TValue;
use lumen_vm::call;
use lumen_vm::error::{type_error, LuaError};
use lumen_vm::metamethod::{fast_tm, Tm};
use lumen_vm::opcode::{jump_target, Insn};
use lumen_vm::vm::Vm;
use tracing::trace;

use crate::fallback::{mismatch, resume_at, Frame, NextPc, SLOWPATH};

/// FORGPREP: prepare `R[a]..R[a+2]` for the loop at `pc`.
pub fn forg_prep(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::ForGPrep { a, d } = insn else {
        return Err(mismatch("FORGPREP", pc, insn));
    };
    let ra = base + a as usize;
    let obj = vm.stack[ra];

    if !obj.is_function() {
        let mt = if obj.is_table() || obj.as_userdata_idx().is_some() {
            vm.gc.metatable_of(obj)
        } else {
            None
        };
        if let Some(iter) = fast_tm(&vm.gc, &vm.mm_names, mt, Tm::Iter) {
            trace!(target: SLOWPATH, pc, "calling __iter");
            vm.stack[ra + 1] = obj;
            vm.stack[ra] = iter;
            vm.top = ra + 2;
            call::call(vm, ra, 3)?;
            vm.top = vm.ci().top;
            // nil in `ra` marks builtin iteration
            if vm.stack[ra].is_nil() {
                return Err(type_error(TValue::nil(), "call"));
            }
        } else if fast_tm(&vm.gc, &vm.mm_names, mt, Tm::Call).is_some() {
            // called on every FORGLOOP
        } else if let Some(h) = obj.as_table_idx() {
            let array_only = !vm.gc.get_table(h).has_live_nodes();
            vm.stack[ra + 1] = obj;
            vm.stack[ra + 2] = IterCursor::start(array_only).to_tvalue();
            vm.stack[ra] = TValue::nil();
        } else {
            return Err(type_error(obj, "iterate over"));
        }
    }
    Ok(resume_at(vm, jump_target(pc, d)))
}

/// The check FORGPREP_NEXT/FORGPREP_INEXT make when `R[a]` is not the
/// builtin they specialize for: anything but a function is an error.
pub fn forg_prep_xnext_fallback(vm: &mut Vm, ra: usize, pc: usize) -> Result<(), LuaError> {
    let f = vm.stack[ra];
    if f.is_function() {
        return Ok(());
    }
    vm.ci_mut().saved_pc = pc;
    Err(type_error(f, "iterate over"))
}

/// FORGPREP_NEXT: `pairs`-style setup.
pub fn forg_prep_next(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::ForGPrepNext { a, d } = insn else {
        return Err(mismatch("FORGPREP_NEXT", pc, insn));
    };
    let ra = base + a as usize;
    let builtin = vm.stack[ra].raw_equal(&vm.builtin_next) && vm.stack[ra + 2].is_nil();
    match vm.stack[ra + 1].as_table_idx() {
        Some(h) if builtin => {
            let array_only = !vm.gc.get_table(h).has_live_nodes();
            vm.stack[ra] = TValue::nil();
            vm.stack[ra + 2] = IterCursor::start(array_only).to_tvalue();
        }
        _ => forg_prep_xnext_fallback(vm, ra, pc)?,
    }
    Ok(resume_at(vm, jump_target(pc, d)))
}

/// FORGPREP_INEXT: `ipairs`-style setup. The cursor never leaves the array
/// part.
pub fn forg_prep_inext(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::ForGPrepINext { a, d } = insn else {
        return Err(mismatch("FORGPREP_INEXT", pc, insn));
    };
    let ra = base + a as usize;
    let builtin = vm.stack[ra].raw_equal(&vm.builtin_inext)
        && vm.stack[ra + 1].is_table()
        && vm.stack[ra + 2].as_number() == Some(0.0);
    if builtin {
        vm.stack[ra] = TValue::nil();
        vm.stack[ra + 2] = IterCursor::start(true).to_tvalue();
    } else {
        forg_prep_xnext_fallback(vm, ra, pc)?;
    }
    Ok(resume_at(vm, jump_target(pc, d)))
}

fn publish(vm: &mut Vm, ra: usize, cursor: IterCursor, next: usize, key: TValue, val: TValue) {
    let cursor = IterCursor { index: next as u32, array_only: cursor.array_only };
    vm.stack[ra + 2] = cursor.to_tvalue();
    vm.stack[ra + 3] = key;
    vm.stack[ra + 4] = val;
}

/// One step of builtin table iteration from `cursor`: array slots first,
/// then hash slots unless the cursor is array-only. On a hit the cursor,
/// key and value are written to `ra+2..ra+4`.
pub fn forg_loop_table_iter(vm: &mut Vm, h: GcIdx<Table>, cursor: IterCursor, ra: usize) -> bool {
    match vm.gc.get_table(h).next_from(cursor.index as usize, cursor.array_only) {
        Some((next, key, val)) => {
            publish(vm, ra, cursor, next, key, val);
            true
        }
        None => false,
    }
}

/// Like [`forg_loop_table_iter`], for native code that walked the array
/// part inline and only needs the hash part.
pub fn forg_loop_node_iter(vm: &mut Vm, h: GcIdx<Table>, cursor: IterCursor, ra: usize) -> bool {
    if cursor.array_only {
        return false;
    }
    match vm.gc.get_table(h).next_node_from(cursor.index as usize) {
        Some((next, key, val)) => {
            publish(vm, ra, cursor, next, key, val);
            true
        }
        None => false,
    }
}

/// One step of a loop over a callable: `R[a+3..a+3+nvars] = R[a](R[a+1], R[a+2])`.
///
/// The first result becomes the new control value. Returns whether it is
/// non-nil, i.e. whether the loop body runs again.
pub fn forg_loop_non_table_fallback(vm: &mut Vm, ra: usize, nvars: u8) -> Result<bool, LuaError> {
    vm.stack[ra + 5] = vm.stack[ra + 2];
    vm.stack[ra + 4] = vm.stack[ra + 1];
    vm.stack[ra + 3] = vm.stack[ra];
    vm.top = ra + 6;
    call::call(vm, ra + 3, nvars as i32)?;
    vm.top = vm.ci().top;
    vm.stack[ra + 2] = vm.stack[ra + 3];
    Ok(!vm.stack[ra + 3].is_nil())
}

/// FORGLOOP: advance the loop prepared at `R[a]` and jump back to the body
/// while it yields values.
pub fn forg_loop(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    let Insn::ForGLoop { a, d, nvars, ipairs } = insn else {
        return Err(mismatch("FORGLOOP", pc, insn));
    };
    let ra = base + a as usize;

    let builtin = if vm.stack[ra].is_nil() {
        vm.stack[ra + 1]
            .as_table_idx()
            .zip(IterCursor::from_tvalue(vm.stack[ra + 2]))
    } else {
        None
    };

    let more = match builtin {
        Some((h, cursor)) => {
            for i in 2..nvars as usize {
                vm.stack[ra + 3 + i] = TValue::nil();
            }
            let index = cursor.index as usize;
            let hole = ipairs
                && vm
                    .gc
                    .get_table(h)
                    .array_values()
                    .get(index)
                    .map_or(true, |v| v.is_nil());
            !hole && forg_loop_table_iter(vm, h, cursor, ra)
        }
        None => forg_loop_non_table_fallback(vm, ra, nvars)?,
    };

    let next = if more { jump_target(pc, d) } else { pc + 1 };
    Ok(resume_at(vm, next))
}
