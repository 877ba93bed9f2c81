use lumen_bridge::call::{call_epilog_c, call_fallback, call_prolog, return_at, CallTarget, Resume};
use lumen_bridge::fallback::get_global;
use lumen_bridge::runtime::{lumen_rt_exit, lumen_rt_get_global};
use lumen_bridge::{NextPc, SIDE_EXIT};
use lumen_core::gc::{NativeContext, NativeError};
use lumen_core::value::TValue;
use lumen_vm::config::VmOptions;
use lumen_vm::error::LuaError;
use lumen_vm::opcode::{CaptureKind, Insn};
use lumen_vm::proto::{Proto, NATIVE_CONTINUE};
use lumen_vm::vm::Vm;

use super::helpers::*;

fn boom(_: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    Err(NativeError::Message("boom".into()))
}

/// `return R0(R1, R2)`
fn call_first() -> Proto {
    Proto::new(
        vec![
            Insn::Call { a: 0, nargs: 2, nresults: -1 },
            Insn::Return { a: 0, count: -1 },
        ],
        vec![],
    )
    .with_params(3, false)
}

#[test]
fn test_call_metamethod_equivalence() {
    let via_call = parity(|vm| {
        let echo = vm.register("echo", echo);
        let t = table(vm, &[1.0, 2.0], &[]);
        set_metafield(vm, t, "__call", echo);
        (call_first(), vec![t, num(1.0), num(2.0)])
    });
    let direct = parity(|vm| {
        let echo = vm.register("echo", echo);
        let t = table(vm, &[1.0, 2.0], &[]);
        let proto = Proto::new(
            vec![
                Insn::Call { a: 0, nargs: 3, nresults: -1 },
                Insn::Return { a: 0, count: -1 },
            ],
            vec![],
        )
        .with_params(4, false);
        (proto, vec![echo, t, num(1.0), num(2.0)])
    });
    assert_eq!(via_call, ["table#2", "1", "2"]);
    assert_eq!(via_call, direct);
}

#[test]
fn test_call_non_callable() {
    let msg = parity_err(|_| (call_first(), vec![num(1.0), num(2.0), num(3.0)]));
    assert_eq!(msg, "attempt to call a number value");
}

#[test]
fn test_native_function_error_unwinds() {
    let msg = parity_err(|vm| {
        let boom = vm.register("boom", boom);
        (call_first(), vec![boom, TValue::nil(), TValue::nil()])
    });
    assert_eq!(msg, "boom");
}

/// `local function add(a, b) return a + b end; return add(R0, R1), 1`
fn nested_add() -> Proto {
    let add = Proto::new(
        vec![Insn::Add { a: 2, b: 0, c: 1 }, Insn::Return { a: 2, count: 1 }],
        vec![],
    )
    .with_params(2, false);
    Proto::new(
        vec![
            Insn::NewClosure { a: 2, d: 0 },
            Insn::Move { a: 3, b: 0 },
            Insn::Move { a: 4, b: 1 },
            Insn::Call { a: 2, nargs: 2, nresults: 1 },
            Insn::LoadN { a: 3, n: 1 },
            Insn::Return { a: 2, count: 2 },
        ],
        vec![],
    )
    .with_params(2, false)
    .with_children(vec![add])
}

#[test]
fn test_lua_to_lua_call() {
    let out = parity(|_| (nested_add(), nums(&[20.0, 22.0])));
    assert_eq!(out, ["42", "1"]);
    assert_eq!(fallbacks_taken(), 1);
}

#[test]
fn test_arith_error_inside_callee() {
    let msg = parity_err(|vm| {
        let t = vm.new_table();
        (nested_add(), vec![num(1.0), t])
    });
    assert_eq!(msg, "attempt to perform arithmetic on a table value");
}

#[test]
fn test_native_recursion_overflows() {
    let mut vm = Vm::with_options(VmOptions { max_call_depth: 50, ..VmOptions::default() });
    let f = kstr(&mut vm, "f");
    // function f() return f() end
    let proto = Proto::new(
        vec![
            Insn::GetGlobal { a: 0, k: 0 },
            Insn::Call { a: 0, nargs: 0, nresults: -1 },
            Insn::Return { a: 0, count: -1 },
        ],
        vec![f],
    );
    let func = vm.load(with_entry(proto));
    vm.set_global("f", func);
    let err = vm.call(func, &[]).unwrap_err();
    assert!(matches!(err, LuaError::StackOverflow));
    assert_eq!(vm.call_stack.len(), 1);
    assert!(vm.pending_error.is_none());
}

fn caller_frame(vm: &mut Vm) -> usize {
    push_frame(vm, Proto::new(vec![Insn::Return { a: 0, count: 0 }], vec![]), &[])
}

#[test]
fn test_call_prolog_runs_native_function() {
    let mut vm = Vm::new();
    let base = caller_frame(&mut vm);
    let echo = vm.register("echo", echo);
    let depth = vm.call_stack.len();
    vm.stack[base..base + 3].copy_from_slice(&[echo, num(1.0), num(2.0)]);

    let pushed = call_prolog(&mut vm, base, base + 3, 4).unwrap();
    assert!(pushed.is_none());
    assert_eq!(vm.call_stack.len(), depth);
    assert_eq!(vm.stack[base].as_number(), Some(1.0));
    assert_eq!(vm.stack[base + 1].as_number(), Some(2.0));
    assert!(vm.stack[base + 2].is_nil());
    assert!(vm.stack[base + 3].is_nil());
    assert_eq!(vm.top, vm.ci().top);
}

#[test]
fn test_call_prolog_multret_sets_top() {
    let mut vm = Vm::new();
    let base = caller_frame(&mut vm);
    let three = vm.register("three", three);
    vm.stack[base] = three;

    call_prolog(&mut vm, base, base + 1, -1).unwrap();
    assert_eq!(vm.top, base + 3);
    assert_eq!(vm.stack[base + 2].as_number(), Some(3.0));
}

#[test]
fn test_call_prolog_pushes_lua_frame_then_returns() {
    let mut vm = Vm::new();
    let base = caller_frame(&mut vm);
    let callee = vm.load(
        Proto::new(
            vec![Insn::Add { a: 2, b: 0, c: 1 }, Insn::Return { a: 2, count: 1 }],
            vec![],
        )
        .with_params(2, false),
    );
    vm.stack[base..base + 3].copy_from_slice(&[callee, num(3.0), num(4.0)]);
    let depth = vm.call_stack.len();

    let cl = call_prolog(&mut vm, base, base + 3, 1).unwrap();
    assert_eq!(cl.map(|c| c.index()), callee.as_closure_idx().map(|c| c.index()));
    assert_eq!(vm.call_stack.len(), depth + 1);
    let cbase = vm.ci().base;
    assert_eq!(cbase, base + 1);
    assert_eq!(vm.stack[cbase + 1].as_number(), Some(4.0));

    vm.stack[cbase + 2] = num(7.0);
    assert_eq!(return_at(&mut vm, 1, cbase).unwrap(), Resume::Interpreter);
    assert_eq!(vm.call_stack.len(), depth);
    assert_eq!(vm.stack[base].as_number(), Some(7.0));
}

#[test]
fn test_call_prolog_resolves_call_metamethod() {
    let mut vm = Vm::new();
    let base = caller_frame(&mut vm);
    let echo = vm.register("echo", echo);
    let t = vm.new_table();
    set_metafield(&mut vm, t, "__call", echo);
    vm.stack[base..base + 2].copy_from_slice(&[t, num(5.0)]);

    call_prolog(&mut vm, base, base + 2, -1).unwrap();
    assert_eq!(vm.top, base + 2);
    assert!(vm.stack[base].raw_equal(&t));
    assert_eq!(vm.stack[base + 1].as_number(), Some(5.0));
}

#[test]
fn test_call_epilog_truncates() {
    let mut vm = Vm::new();
    let base = caller_frame(&mut vm);
    let three = vm.register("three", three);
    let depth = vm.call_stack.len();
    vm.stack[base] = three;
    vm.top = base + 1;
    let nf = three.as_native_idx().unwrap();

    let n = lumen_vm::call::invoke_native(&mut vm, base, nf, 1).unwrap();
    assert_eq!(n, 3);
    assert_eq!(vm.call_stack.len(), depth + 1);
    call_epilog_c(&mut vm, 1, n);
    assert_eq!(vm.call_stack.len(), depth);
    assert_eq!(vm.stack[base].as_number(), Some(1.0));
    assert_eq!(vm.top, vm.ci().top);
}

#[test]
fn test_return_resume_targets() {
    let callee = || {
        Proto::new(
            vec![Insn::LoadN { a: 0, n: 1 }, Insn::Return { a: 0, count: 1 }],
            vec![],
        )
    };

    // native caller
    let mut vm = Vm::new();
    caller_frame(&mut vm);
    vm.ci_mut().set_native(true);
    let base = push_frame(&mut vm, callee(), &[]);
    assert_eq!(return_at(&mut vm, 1, base).unwrap(), Resume::NativeCaller);

    // entered from the host
    let mut vm = Vm::new();
    let base = push_frame(&mut vm, callee(), &[]);
    vm.ci_mut().set_return(true);
    let func = vm.ci().func;
    vm.stack[base] = num(8.0);
    assert_eq!(return_at(&mut vm, 1, base).unwrap(), Resume::Host);
    assert_eq!(vm.top, func + 1);
    assert_eq!(vm.stack[func].as_number(), Some(8.0));

    // wrong opcode
    let mut vm = Vm::new();
    let base = push_frame(&mut vm, callee(), &[]);
    assert!(return_at(&mut vm, 0, base).is_err());
}

#[test]
fn test_call_fallback_targets() {
    let code = || {
        vec![
            Insn::Call { a: 0, nargs: 0, nresults: 1 },
            Insn::Return { a: 0, count: 1 },
        ]
    };
    let leaf = || {
        Proto::new(vec![Insn::LoadN { a: 0, n: 2 }, Insn::Return { a: 0, count: 1 }], vec![])
    };

    let mut vm = Vm::new();
    let three = vm.register("three", three);
    let base = push_frame(&mut vm, Proto::new(code(), vec![]), &[]);
    vm.stack[base] = three;
    assert_eq!(call_fallback(&mut vm, 0, base).unwrap(), CallTarget::Handled);
    assert_eq!(vm.ci().saved_pc, 1);
    assert_eq!(vm.stack[base].as_number(), Some(1.0));

    for (native, expected) in [(false, CallTarget::Interpreter), (true, CallTarget::Native)] {
        let mut vm = Vm::new();
        let f = vm.load(if native { with_entry(leaf()) } else { leaf() });
        let base = push_frame(&mut vm, Proto::new(code(), vec![]), &[]);
        let depth = vm.call_stack.len();
        vm.stack[base] = f;
        assert_eq!(call_fallback(&mut vm, 0, base).unwrap(), expected);
        assert_eq!(vm.call_stack.len(), depth + 1);
        assert_eq!(vm.call_stack[depth - 1].saved_pc, 1);
    }
}

#[test]
fn test_single_step_hands_back_after_each_fallback() {
    let mut vm = Vm::with_options(VmOptions { single_step: true, ..VmOptions::default() });
    vm.set_global("g", num(6.0));
    let g = kstr(&mut vm, "g");
    let proto = Proto::new(
        vec![Insn::GetGlobal { a: 0, k: 0 }, Insn::Return { a: 0, count: 1 }],
        vec![g],
    );
    let base = push_frame(&mut vm, proto, &[]);
    vm.ci_mut().set_native(true);

    assert_eq!(get_global(&mut vm, 0, base).unwrap(), NextPc::Interpreter);
    assert_eq!(vm.stack[base].as_number(), Some(6.0));
    assert_eq!(vm.ci().saved_pc, 1);
    assert!(!vm.ci().is_native());

    vm.ci_mut().set_native(true);
    let vp: *mut Vm = &mut vm;
    let code = unsafe { lumen_rt_get_global(vp, 0, base as u64) };
    assert_eq!(code, SIDE_EXIT);
    assert!(vm.pending_error.is_none());
    assert_eq!(unsafe { lumen_rt_exit(vp, code) }, NATIVE_CONTINUE);
}

#[test]
fn test_single_step_program_still_runs() {
    let mut vm = Vm::with_options(VmOptions { single_step: true, ..VmOptions::default() });
    let out = run(&mut vm, with_entry(nested_add()), &nums(&[1.0, 2.0]));
    assert_eq!(out[0].as_number(), Some(3.0));
}

#[test]
fn test_closure_capture_through_native_frame() {
    // local x = R0; local function get() return x end; return get()
    let out = parity(|_| {
        let get = Proto::new(
            vec![Insn::GetUpval { a: 0, u: 0 }, Insn::Return { a: 0, count: 1 }],
            vec![],
        )
        .with_upvalues(1);
        let proto = Proto::new(
            vec![
                Insn::NewClosure { a: 1, d: 0 },
                Insn::Capture { kind: CaptureKind::Val, b: 0 },
                Insn::Call { a: 1, nargs: 0, nresults: 1 },
                Insn::Return { a: 1, count: 1 },
            ],
            vec![],
        )
        .with_params(1, false)
        .with_children(vec![get]);
        (proto, vec![num(31.0)])
    });
    assert_eq!(out, ["31"]);
}
