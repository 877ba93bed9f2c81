use lumen_vm::config::VmOptions;
use lumen_vm::error::LuaError;
use lumen_vm::opcode::Insn;
use lumen_vm::proto::{Proto, NATIVE_CONTINUE, NATIVE_ERROR};
use lumen_vm::vm::Vm;

use super::helpers::*;

/// Hands the frame straight back to the interpreter.
unsafe extern "C" fn decline(vm: *mut Vm, _base: usize) -> i64 {
    let vm = &mut *vm;
    vm.ci_mut().set_native(false);
    NATIVE_CONTINUE
}

unsafe extern "C" fn refuse(vm: *mut Vm, _base: usize) -> i64 {
    let vm = &mut *vm;
    vm.pending_error = Some(LuaError::runtime("refused"));
    NATIVE_ERROR
}

fn answer() -> Proto {
    Proto::new(
        vec![Insn::LoadN { a: 0, n: 42 }, Insn::Return { a: 0, count: 1 }],
        vec![],
    )
}

#[test]
fn test_declining_entry_falls_back_to_interpreter() {
    let mut vm = Vm::new();
    let out = run(&mut vm, answer().with_native(decline), &[]);
    assert_num(&out, 0, 42.0);
}

#[test]
fn test_entry_error_is_reported() {
    let mut vm = Vm::new();
    assert_eq!(run_err(&mut vm, answer().with_native(refuse), &[]), "refused");
    assert!(vm.pending_error.is_none());
}

#[test]
fn test_entry_ignored_when_native_disabled() {
    for options in [
        VmOptions { native_enabled: false, ..VmOptions::default() },
        VmOptions { single_step: true, ..VmOptions::default() },
    ] {
        let mut vm = Vm::with_options(options);
        let out = run(&mut vm, answer().with_native(refuse), &[]);
        assert_num(&out, 0, 42.0);
    }
}
