use lumen_vm::config::VmOptions;
use lumen_vm::opcode::{CaptureKind, Insn};
use lumen_vm::proto::Proto;
use lumen_vm::vm::Vm;

use super::helpers::*;

/// Sums `t` with `ipairs` while allocating a closure over `keep` and a
/// table every iteration; returns `keep.v` and the sum.
fn churn(vm: &mut Vm) -> Proto {
    let ipairs = kstr(vm, "ipairs");
    let v = kstr(vm, "v");
    let child = Proto::new(vec![Insn::Return { a: 0, count: 0 }], vec![]).with_upvalues(1);
    Proto::new(
        vec![
            Insn::NewTable { a: 1, array_size: 0, hash_size: 1 },
            Insn::LoadN { a: 7, n: 5 },
            Insn::SetTableKs { a: 7, b: 1, k: 1 },
            Insn::LoadN { a: 9, n: 0 },
            Insn::GetGlobal { a: 2, k: 0 },
            Insn::Move { a: 3, b: 0 },
            Insn::Call { a: 2, nargs: 1, nresults: 3 },
            Insn::ForGPrepINext { a: 2, d: 4 },
            Insn::NewClosure { a: 7, d: 0 },
            Insn::Capture { kind: CaptureKind::Val, b: 1 },
            Insn::NewTable { a: 10, array_size: 0, hash_size: 0 },
            Insn::Add { a: 9, b: 9, c: 6 },
            Insn::ForGLoop { a: 2, d: -5, nvars: 2, ipairs: true },
            Insn::GetTableKs { a: 8, b: 1, k: 1 },
            Insn::Return { a: 8, count: 2 },
        ],
        vec![ipairs, v],
    )
    .with_params(1, false)
    .with_stack(12)
    .with_children(vec![child])
}

fn run_churn(native: bool) -> (Vec<String>, usize) {
    let mut vm = Vm::with_options(VmOptions {
        native_enabled: native,
        gc_min_threshold: 64,
        ..VmOptions::default()
    });
    let values: Vec<f64> = (1..=1500).map(f64::from).collect();
    let t = table(&mut vm, &values, &[]);
    let proto = churn(&mut vm);
    let proto = if native { with_entry(proto) } else { proto };
    let out = run(&mut vm, proto, &[t]);
    (describe_all(&vm, &out), vm.gc.live_objects())
}

#[test]
fn test_collection_during_native_loop() {
    let (interpreted, _) = run_churn(false);
    reset_fallbacks();
    let (native, live) = run_churn(true);
    assert_eq!(native, interpreted);
    assert_eq!(native, ["5", "1125750"]);
    assert!(fallbacks_taken() > 0);
    assert!(live < 1000, "{live} live objects");
}
