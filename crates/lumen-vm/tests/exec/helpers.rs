use lumen_core::gc::{NativeContext, NativeError};
use lumen_core::value::TValue;
use lumen_vm::proto::{Constant, Proto};
use lumen_vm::vm::Vm;
use tracing_subscriber::EnvFilter;

/// Send `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Load `proto` and call it with `args`, panicking on a runtime error.
pub fn run(vm: &mut Vm, proto: Proto, args: &[TValue]) -> Vec<TValue> {
    init_tracing();
    let f = vm.load(proto);
    vm.call(f, args)
        .unwrap_or_else(|e| panic!("runtime error: {e}"))
}

/// Load `proto` and call it, expecting a runtime error.
pub fn run_err(vm: &mut Vm, proto: Proto, args: &[TValue]) -> String {
    init_tracing();
    let f = vm.load(proto);
    match vm.call(f, args) {
        Err(e) => e.to_string(),
        Ok(vals) => panic!("expected error, got {} results: {:?}", vals.len(), vals),
    }
}

/// String constant interned in `vm`.
pub fn kstr(vm: &mut Vm, s: &str) -> Constant {
    Constant::String(vm.intern(s))
}

/// Check that results[idx] is a number with the expected value.
pub fn assert_num(results: &[TValue], idx: usize, expected: f64) {
    let val = results[idx];
    let got = val
        .as_number()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected number {expected}", val));
    assert_eq!(got, expected, "result[{idx}] = {got}, expected {expected}");
}

pub fn assert_nil(results: &[TValue], idx: usize) {
    assert!(results[idx].is_nil(), "result[{idx}] = {:?}, expected nil", results[idx]);
}

/// A table with `values` in its array part and `fields` in its hash part.
pub fn table(vm: &mut Vm, values: &[f64], fields: &[(&str, f64)]) -> TValue {
    let t = vm.new_table();
    let h = t.as_table_idx().unwrap();
    for (i, v) in values.iter().enumerate() {
        vm.gc.get_table_mut(h).raw_seti(i as i64 + 1, TValue::from_number(*v));
    }
    for (name, v) in fields {
        let sid = vm.intern(name);
        vm.gc.get_table_mut(h).raw_set_str(sid, TValue::from_number(*v));
    }
    t
}

/// Give `t` a fresh metatable with `field` set to `value`.
pub fn set_metafield(vm: &mut Vm, t: TValue, field: &str, value: TValue) {
    let mt = vm.gc.alloc_table(0, 1);
    let sid = vm.intern(field);
    vm.gc.get_table_mut(mt).raw_set_str(sid, value);
    if let Some(h) = t.as_table_idx() {
        vm.gc.get_table_mut(h).metatable = Some(mt);
    } else if let Some(u) = t.as_userdata_idx() {
        vm.gc.get_userdata_mut(u).metatable = Some(mt);
    } else {
        panic!("value cannot carry a metatable: {t:?}");
    }
}

/// Returns its arguments.
pub fn echo(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    Ok(ctx.args.to_vec())
}

/// Returns 1, 2, 3.
pub fn three(_: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    Ok(vec![
        TValue::from_number(1.0),
        TValue::from_number(2.0),
        TValue::from_number(3.0),
    ])
}
