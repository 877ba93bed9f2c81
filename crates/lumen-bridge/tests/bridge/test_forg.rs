use lumen_bridge::forg::{
    forg_loop, forg_loop_node_iter, forg_loop_table_iter, forg_prep, forg_prep_xnext_fallback,
};
use lumen_bridge::runtime::{lumen_rt_forg_loop_node_iter, lumen_rt_forg_loop_table_iter};
use lumen_bridge::NextPc;
use lumen_core::gc::{NativeContext, NativeError};
use lumen_core::table::IterCursor;
use lumen_core::value::TValue;
use lumen_vm::opcode::Insn;
use lumen_vm::proto::Proto;
use lumen_vm::vm::Vm;

use super::helpers::*;

/// `local acc = 0; for k, v in <iter>(t) do acc += v end; return acc`
/// with `t` in R0, the iterator triple in R2..R4 and the loop variables in
/// R5, R6.
fn sum_with(vm: &mut Vm, iter: Option<&str>, prep: Insn, ipairs: bool) -> Proto {
    let mut constants = Vec::new();
    let mut code = vec![Insn::LoadN { a: 1, n: 0 }];
    match iter {
        Some(name) => {
            constants.push(kstr(vm, name));
            code.push(Insn::GetGlobal { a: 2, k: 0 });
            code.push(Insn::Move { a: 3, b: 0 });
            code.push(Insn::Call { a: 2, nargs: 1, nresults: 3 });
        }
        None => {
            code.push(Insn::Move { a: 2, b: 0 });
            code.push(Insn::LoadNil { a: 3 });
            code.push(Insn::LoadNil { a: 4 });
        }
    }
    code.push(prep);
    code.push(Insn::Add { a: 1, b: 1, c: 6 });
    code.push(Insn::ForGLoop { a: 2, d: -2, nvars: 2, ipairs });
    code.push(Insn::Return { a: 1, count: 1 });
    Proto::new(code, constants).with_params(1, false)
}

#[test]
fn test_pairs_parity() {
    let out = parity(|vm| {
        let t = table(vm, &[10.0, 20.0, 30.0], &[("x", 5.0), ("y", 0.5)]);
        let proto = sum_with(vm, Some("pairs"), Insn::ForGPrepNext { a: 2, d: 1 }, false);
        (proto, vec![t])
    });
    assert_eq!(out, ["65.5"]);
}

#[test]
fn test_ipairs_parity_stops_at_hole() {
    let out = parity(|vm| {
        let t = table(vm, &[1.0, 2.0], &[("x", 100.0)]);
        vm.gc.get_table_mut(t.as_table_idx().unwrap()).raw_seti(4, num(1000.0));
        let proto = sum_with(vm, Some("ipairs"), Insn::ForGPrepINext { a: 2, d: 1 }, true);
        (proto, vec![t])
    });
    assert_eq!(out, ["3"]);
}

#[test]
fn test_generic_table_parity() {
    let out = parity(|vm| {
        let t = table(vm, &[1.0, 2.0, 3.0], &[("k", 4.0)]);
        (sum_with(vm, None, Insn::ForGPrep { a: 2, d: 1 }, false), vec![t])
    });
    assert_eq!(out, ["10"]);
}

#[test]
fn test_function_iterator_parity() {
    let out = parity(|vm| {
        let t = table(vm, &[1.0, 2.0], &[("k", 7.0)]);
        let next = kstr(vm, "next");
        let proto = Proto::new(
            vec![
                Insn::LoadN { a: 1, n: 0 },
                Insn::GetGlobal { a: 2, k: 0 },
                Insn::Move { a: 3, b: 0 },
                Insn::LoadNil { a: 4 },
                Insn::ForGPrep { a: 2, d: 1 },
                Insn::Add { a: 1, b: 1, c: 6 },
                Insn::ForGLoop { a: 2, d: -2, nvars: 2, ipairs: false },
                Insn::Return { a: 1, count: 1 },
            ],
            vec![next],
        )
        .with_params(1, false);
        (proto, vec![t])
    });
    assert_eq!(out, ["10"]);
}

fn iter_with_next(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    Ok(vec![ctx.upvalue(0), ctx.arg(0), TValue::nil()])
}

#[test]
fn test_iter_metamethod_parity() {
    let out = parity(|vm| {
        let t = table(vm, &[1.0, 2.0], &[("k", 3.0)]);
        let next = vm.builtin_next;
        let iter = vm.new_native("iter", iter_with_next, vec![next]);
        set_metafield(vm, t, "__iter", iter);
        (sum_with(vm, None, Insn::ForGPrep { a: 2, d: 1 }, false), vec![t])
    });
    assert_eq!(out, ["6"]);
}

#[test]
fn test_iterate_over_number() {
    let msg = parity_err(|vm| {
        let proto = sum_with(vm, None, Insn::ForGPrep { a: 2, d: 1 }, false);
        (proto, vec![num(1.0)])
    });
    assert_eq!(msg, "attempt to iterate over a number value");
}

/// Array-only loop whose body adds a hash key to the table it walks:
/// `for k, v in t do t.x = v; acc += v end`.
fn growing_loop(vm: &mut Vm) -> Proto {
    let x = kstr(vm, "x");
    Proto::new(
        vec![
            Insn::LoadN { a: 1, n: 0 },
            Insn::Move { a: 2, b: 0 },
            Insn::LoadNil { a: 3 },
            Insn::LoadNil { a: 4 },
            Insn::ForGPrep { a: 2, d: 2 },
            Insn::SetTableKs { a: 6, b: 0, k: 0 },
            Insn::Add { a: 1, b: 1, c: 6 },
            Insn::ForGLoop { a: 2, d: -3, nvars: 2, ipairs: false },
            Insn::Return { a: 1, count: 1 },
        ],
        vec![x],
    )
    .with_params(1, false)
}

#[test]
fn test_array_only_strategy_is_stable() {
    let out = parity(|vm| {
        let t = table(vm, &[1.0, 2.0, 3.0], &[]);
        (growing_loop(vm), vec![t])
    });
    assert_eq!(out, ["6"]);
}

#[test]
fn test_array_only_cursor_ignores_new_hash_keys() {
    let mut vm = Vm::new();
    let t = table(&mut vm, &[1.0, 2.0], &[]);
    let proto = growing_loop(&mut vm);
    let base = push_frame(&mut vm, proto, &[t]);
    let ra = base + 2;
    vm.stack[ra] = t;

    assert_eq!(forg_prep(&mut vm, 4, base).unwrap(), NextPc::Native(7));
    let cursor = IterCursor::from_tvalue(vm.stack[ra + 2]).unwrap();
    assert!(cursor.array_only);
    assert!(vm.stack[ra].is_nil());

    assert_eq!(forg_loop(&mut vm, 7, base).unwrap(), NextPc::Native(5));
    assert_eq!(vm.stack[ra + 4].as_number(), Some(1.0));

    let h = t.as_table_idx().unwrap();
    let x = vm.intern("x");
    vm.gc.get_table_mut(h).raw_set_str(x, num(50.0));

    assert_eq!(forg_loop(&mut vm, 7, base).unwrap(), NextPc::Native(5));
    assert_eq!(vm.stack[ra + 4].as_number(), Some(2.0));
    assert_eq!(forg_loop(&mut vm, 7, base).unwrap(), NextPc::Native(8));
}

#[test]
fn test_table_and_node_iteration_steps() {
    let mut vm = Vm::new();
    let t = table(&mut vm, &[1.0], &[("a", 2.0)]);
    let h = t.as_table_idx().unwrap();
    let base = push_frame(&mut vm, Proto::new(vec![Insn::Nop], vec![]), &[]);

    // the node step skips the array part and stops at the end
    let cursor = IterCursor::start(false);
    assert!(forg_loop_node_iter(&mut vm, h, cursor, base));
    assert_eq!(vm.stack[base + 4].as_number(), Some(2.0));
    let cursor = IterCursor::from_tvalue(vm.stack[base + 2]).unwrap();
    assert!(!forg_loop_node_iter(&mut vm, h, cursor, base));

    // an array-only cursor never reaches the hash part
    assert!(!forg_loop_node_iter(&mut vm, h, IterCursor::start(true), base));
    assert!(forg_loop_table_iter(&mut vm, h, IterCursor::start(true), base));
    let cursor = IterCursor::from_tvalue(vm.stack[base + 2]).unwrap();
    assert!(!forg_loop_table_iter(&mut vm, h, cursor, base));

    let vp: *mut Vm = &mut vm;
    let start = IterCursor::start(false).to_tvalue().raw_bits();
    let hit = unsafe { lumen_rt_forg_loop_table_iter(vp, t.raw_bits(), start, base as u64) };
    assert_eq!(hit, 1);
    assert_eq!(vm.stack[base + 4].as_number(), Some(1.0));
    let hit = unsafe { lumen_rt_forg_loop_node_iter(vp, num(1.0).raw_bits(), start, base as u64) };
    assert_eq!(hit, 0);
}

#[test]
fn test_xnext_fallback_accepts_only_functions() {
    let mut vm = Vm::new();
    let base = push_frame(&mut vm, Proto::new(vec![Insn::Nop, Insn::Nop], vec![]), &[]);
    vm.stack[base] = vm.builtin_next;
    assert!(forg_prep_xnext_fallback(&mut vm, base, 1).is_ok());

    let t = vm.new_table();
    vm.stack[base] = t;
    let err = forg_prep_xnext_fallback(&mut vm, base, 1).unwrap_err();
    assert_eq!(err.to_string(), "attempt to iterate over a table value");
    assert_eq!(vm.ci().saved_pc, 1);
}
