use lumen_bridge::fallback::set_list;
use lumen_bridge::NextPc;
use lumen_core::value::TValue;
use lumen_vm::opcode::Insn;
use lumen_vm::proto::Proto;
use lumen_vm::vm::Vm;
use proptest::prelude::*;

use super::helpers::*;

proptest! {
    #[test]
    fn prop_setlist_order_and_growth(
        values in prop::collection::vec(-1000i32..1000, 0..40),
        index in 1u32..10,
        presize in 0usize..50,
        multret in any::<bool>(),
    ) {
        let mut vm = Vm::new();
        let h = vm.gc.alloc_table(presize, 1);
        let hk = vm.intern("h");
        vm.gc.get_table_mut(h).raw_set_str(hk, num(99.0));
        let t = TValue::from_table(h);

        let n = values.len();
        let count = if multret { -1 } else { n as i32 };
        let proto = Proto::new(
            vec![
                Insn::SetList { a: 0, b: 1, count, index },
                Insn::Return { a: 0, count: 1 },
            ],
            vec![],
        )
        .with_params(1, false)
        .with_stack(64);
        let base = push_frame(&mut vm, proto, &[t]);
        for (i, v) in values.iter().enumerate() {
            vm.stack[base + 1 + i] = num(*v as f64);
        }
        if multret {
            vm.top = base + 1 + n;
        }

        prop_assert_eq!(set_list(&mut vm, 0, base).unwrap(), NextPc::Native(1));
        let table = vm.gc.get_table(h);
        for (i, v) in values.iter().enumerate() {
            let key = index as i64 + i as i64;
            prop_assert_eq!(table.raw_geti(key).as_number(), Some(*v as f64));
        }
        prop_assert_eq!(table.raw_get_str(hk).as_number(), Some(99.0));
        if n > 0 {
            prop_assert!(table.array_len() >= index as usize - 1 + n);
        }
        if multret {
            prop_assert_eq!(vm.top, vm.ci().top);
        }
    }
}

#[test]
fn test_setlist_parity_after_multret_call() {
    let out = parity(|vm| {
        vm.register("three", three);
        let k = kstr(vm, "three");
        let proto = Proto::new(
            vec![
                Insn::NewTable { a: 0, array_size: 0, hash_size: 0 },
                Insn::LoadN { a: 1, n: 7 },
                Insn::GetGlobal { a: 2, k: 0 },
                Insn::Call { a: 2, nargs: 0, nresults: -1 },
                Insn::SetList { a: 0, b: 1, count: -1, index: 1 },
                Insn::GetTableN { a: 1, b: 0, n: 3 },
                Insn::Return { a: 0, count: 2 },
            ],
            vec![k],
        );
        (proto, vec![])
    });
    assert_eq!(out, ["table#4", "3"]);
}

#[test]
fn test_setlist_overwrites_existing_entries() {
    let mut vm = Vm::new();
    let t = table(&mut vm, &[1.0, 2.0, 3.0, 4.0], &[]);
    let proto = Proto::new(
        vec![Insn::SetList { a: 0, b: 1, count: 2, index: 2 }],
        vec![],
    )
    .with_params(3, false);
    let base = push_frame(&mut vm, proto, &[t, num(20.0), num(30.0)]);
    set_list(&mut vm, 0, base).unwrap();
    let table = vm.gc.get_table(t.as_table_idx().unwrap());
    let got: Vec<_> = (1..=4).map(|i| table.raw_geti(i).as_number()).collect();
    assert_eq!(got, [Some(1.0), Some(20.0), Some(30.0), Some(4.0)]);
}

#[test]
fn test_setlist_on_non_table() {
    let msg = parity_err(|_| {
        let proto = Proto::new(
            vec![
                Insn::LoadN { a: 0, n: 1 },
                Insn::LoadN { a: 1, n: 2 },
                Insn::SetList { a: 0, b: 1, count: 1, index: 1 },
                Insn::Return { a: 0, count: 0 },
            ],
            vec![],
        );
        (proto, vec![])
    });
    assert_eq!(msg, "attempt to index a number value");
}
