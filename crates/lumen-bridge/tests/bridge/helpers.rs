use std::cell::Cell;

use lumen_bridge::runtime::{
    lumen_rt_call_fallback, lumen_rt_exit, lumen_rt_fallback, lumen_rt_gc_check,
    lumen_rt_return_fallback,
};
use lumen_bridge::{FallbackOp, SIDE_EXIT};
use lumen_core::gc::{NativeContext, NativeError};
use lumen_core::object::type_name;
use lumen_core::value::TValue;
use lumen_vm::call::enter_lua;
use lumen_vm::config::VmOptions;
use lumen_vm::limits::LUA_MULTRET;
use lumen_vm::opcode::{jump_target, Insn};
use lumen_vm::proto::{Constant, Proto};
use lumen_vm::vm::Vm;
use tracing_subscriber::EnvFilter;

thread_local! {
    static FALLBACKS: Cell<usize> = const { Cell::new(0) };
}

/// Fallbacks taken by [`shim_entry`] on this thread.
pub fn fallbacks_taken() -> usize {
    FALLBACKS.with(Cell::get)
}

pub fn reset_fallbacks() {
    FALLBACKS.with(|c| c.set(0));
}

/// Native entry that can run any frame: trivial instructions inline,
/// bridged ones through the runtime shims, anything else handed to the
/// interpreter.
pub unsafe extern "C" fn shim_entry(vm: *mut Vm, _base: usize) -> i64 {
    let mut pc = (*vm).ci().saved_pc;
    loop {
        let (insn, base, proto_idx) = {
            let v = &*vm;
            let ci = v.ci();
            (v.protos[ci.proto_idx].code.get(pc).copied(), ci.base, ci.proto_idx)
        };
        let Some(insn) = insn else {
            return lumen_rt_exit(vm, pc as i64);
        };
        let next = match insn {
            Insn::Nop => pc as i64 + 1,
            Insn::Move { a, b } => {
                let v = &mut *vm;
                v.stack[base + a as usize] = v.stack[base + b as usize];
                pc as i64 + 1
            }
            Insn::LoadNil { a } => {
                (&mut (*vm).stack)[base + a as usize] = TValue::nil();
                pc as i64 + 1
            }
            Insn::LoadN { a, n } => {
                (&mut (*vm).stack)[base + a as usize] = TValue::from_number(n as f64);
                pc as i64 + 1
            }
            Insn::LoadK { a, k } => {
                let v = &mut *vm;
                v.stack[base + a as usize] = v.protos[proto_idx].k[k as usize];
                pc as i64 + 1
            }
            Insn::NewTable { a, array_size, hash_size } => {
                lumen_rt_gc_check(vm);
                let v = &mut *vm;
                let h = v.gc.alloc_table(array_size as usize, hash_size as usize);
                v.stack[base + a as usize] = TValue::from_table(h);
                pc as i64 + 1
            }
            Insn::Jump { d } => jump_target(pc, d) as i64,
            Insn::Add { a, b, c } => {
                let v = &mut *vm;
                let lhs = v.stack[base + b as usize].as_number();
                let rhs = v.stack[base + c as usize].as_number();
                match lhs.zip(rhs) {
                    Some((x, y)) => {
                        v.stack[base + a as usize] = TValue::from_number(x + y);
                        pc as i64 + 1
                    }
                    None => return lumen_rt_exit(vm, pc as i64),
                }
            }
            Insn::Call { .. } => lumen_rt_call_fallback(vm, pc as u64, base as u64),
            Insn::Return { .. } => return lumen_rt_return_fallback(vm, pc as u64, base as u64),
            other if FallbackOp::for_insn(&other).is_some() => {
                FALLBACKS.with(|c| c.set(c.get() + 1));
                lumen_rt_fallback(vm, pc as u64, base as u64)
            }
            _ => return lumen_rt_exit(vm, pc as i64),
        };
        if next < 0 {
            return lumen_rt_exit(vm, SIDE_EXIT);
        }
        pc = next as usize;
    }
}

/// Attach [`shim_entry`] to `proto` and all of its children.
pub fn with_entry(mut proto: Proto) -> Proto {
    proto.protos = std::mem::take(&mut proto.protos)
        .into_iter()
        .map(with_entry)
        .collect();
    proto.with_native(shim_entry)
}

pub fn interpreter_only() -> Vm {
    Vm::with_options(VmOptions { native_enabled: false, ..VmOptions::default() })
}

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

pub fn run_err(vm: &mut Vm, proto: Proto, args: &[TValue]) -> String {
    init_tracing();
    let f = vm.load(proto);
    match vm.call(f, args) {
        Err(e) => e.to_string(),
        Ok(vals) => panic!("expected error, got {} results: {:?}", vals.len(), vals),
    }
}

/// Run the program `build` sets up once interpreted and once through
/// [`shim_entry`], check both describe the same results, and return them.
pub fn parity<F>(build: F) -> Vec<String>
where
    F: Fn(&mut Vm) -> (Proto, Vec<TValue>),
{
    let mut vm = interpreter_only();
    let (proto, args) = build(&mut vm);
    let out = run(&mut vm, proto, &args);
    let interpreted = describe_all(&vm, &out);

    reset_fallbacks();
    let mut vm = Vm::new();
    let (proto, args) = build(&mut vm);
    let out = run(&mut vm, with_entry(proto), &args);
    let native = describe_all(&vm, &out);

    assert_eq!(native, interpreted, "native and interpreted runs differ");
    native
}

/// Like [`parity`] for a program that fails; returns the error message.
pub fn parity_err<F>(build: F) -> String
where
    F: Fn(&mut Vm) -> (Proto, Vec<TValue>),
{
    let mut vm = interpreter_only();
    let (proto, args) = build(&mut vm);
    let interpreted = run_err(&mut vm, proto, &args);

    reset_fallbacks();
    let mut vm = Vm::new();
    let (proto, args) = build(&mut vm);
    let native = run_err(&mut vm, with_entry(proto), &args);
    assert!(vm.pending_error.is_none());

    assert_eq!(native, interpreted, "native and interpreted errors differ");
    native
}

/// VM-independent rendering of a value.
pub fn describe(vm: &Vm, v: TValue) -> String {
    if let Some(n) = v.as_number() {
        n.to_string()
    } else if let Some(sid) = v.as_string_id() {
        format!("{:?}", vm.strings.get_lossy(sid))
    } else if let Some(h) = v.as_table_idx() {
        format!("table#{}", vm.gc.get_table(h).length())
    } else {
        type_name(v).to_string()
    }
}

pub fn describe_all(vm: &Vm, vals: &[TValue]) -> Vec<String> {
    vals.iter().map(|v| describe(vm, *v)).collect()
}

/// Push a frame for `proto`, as a caller would, without running it.
/// Returns the frame's base.
pub fn push_frame(vm: &mut Vm, proto: Proto, args: &[TValue]) -> usize {
    let f = vm.load(proto);
    let func = vm.top;
    vm.stack[func] = f;
    vm.stack[func + 1..func + 1 + args.len()].copy_from_slice(args);
    vm.top = func + 1 + args.len();
    let cl = f.as_closure_idx().unwrap();
    enter_lua(vm, func, cl, LUA_MULTRET).unwrap();
    vm.ci().base
}

pub fn kstr(vm: &mut Vm, s: &str) -> Constant {
    Constant::String(vm.intern(s))
}

pub fn num(n: f64) -> TValue {
    TValue::from_number(n)
}

pub fn nums(values: &[f64]) -> Vec<TValue> {
    values.iter().map(|v| num(*v)).collect()
}

/// A table with `values` in its array part and `fields` in its hash part.
pub fn table(vm: &mut Vm, values: &[f64], fields: &[(&str, f64)]) -> TValue {
    let t = vm.new_table();
    let h = t.as_table_idx().unwrap();
    for (i, v) in values.iter().enumerate() {
        vm.gc.get_table_mut(h).raw_seti(i as i64 + 1, num(*v));
    }
    for (name, v) in fields {
        let sid = vm.intern(name);
        vm.gc.get_table_mut(h).raw_set_str(sid, num(*v));
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

/// `t1 -> t2 -> ... -> tN` through `__index` tables, with `field = 1` only
/// in the last one. Returns `t1`.
pub fn index_chain(vm: &mut Vm, levels: usize, field: &str) -> TValue {
    let mut t = table(vm, &[], &[(field, 1.0)]);
    for _ in 1..levels {
        let outer = vm.new_table();
        set_metafield(vm, outer, "__index", t);
        t = outer;
    }
    t
}

fn count_and_answer(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    if let Some(t) = ctx.upvalue(0).as_table_idx() {
        let n = ctx.gc.get_table(t).raw_geti(1).as_number().unwrap_or(0.0);
        ctx.gc.get_table_mut(t).raw_seti(1, num(n + 1.0));
    }
    Ok(vec![ctx.upvalue(1)])
}

/// A native function that returns `answer` and counts its calls in
/// `counter[1]`.
pub fn counting(vm: &mut Vm, answer: TValue) -> (TValue, TValue) {
    let counter = vm.new_table();
    let f = vm.new_native("counting", count_and_answer, vec![counter, answer]);
    (f, counter)
}

pub fn count_of(vm: &Vm, counter: TValue) -> f64 {
    let h = counter.as_table_idx().unwrap();
    vm.gc.get_table(h).raw_geti(1).as_number().unwrap_or(0.0)
}

/// Returns its arguments.
pub fn echo(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    Ok(ctx.args.to_vec())
}

/// Returns 1, 2, 3.
pub fn three(_: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    Ok(nums(&[1.0, 2.0, 3.0]))
}
