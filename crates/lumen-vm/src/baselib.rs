//! Builtin iteration functions: `next`, `pairs`, `ipairs`.
//!
//! `next` and the ipairs step function are remembered on the VM so the
//! specialized FORGPREP variants can recognize them.

use lumen_core::gc::{NativeContext, NativeError};
use lumen_core::object::type_name;
use lumen_core::table::Table;
use lumen_core::value::TValue;

use crate::vm::Vm;

pub fn open(vm: &mut Vm) {
    let next = vm.register("next", lua_next);
    let inext = vm.new_native("inext", lua_inext, Vec::new());
    vm.builtin_next = next;
    vm.builtin_inext = inext;

    let pairs = vm.new_native("pairs", lua_pairs, vec![next]);
    vm.set_global("pairs", pairs);
    let ipairs = vm.new_native("ipairs", lua_ipairs, vec![inext]);
    vm.set_global("ipairs", ipairs);
}

fn check_table<'a>(ctx: &'a NativeContext, name: &str) -> Result<&'a Table, NativeError> {
    let v = ctx.arg(0);
    match v.as_table_idx() {
        Some(t) => Ok(ctx.gc.get_table(t)),
        None => Err(NativeError::Message(format!(
            "invalid argument #1 to '{name}' (table expected, got {})",
            if ctx.args.is_empty() { "no value" } else { type_name(v) }
        ))),
    }
}

fn lua_next(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let t = check_table(ctx, "next")?;
    match t.next(ctx.arg(1)) {
        Ok(Some((k, v))) => Ok(vec![k, v]),
        Ok(None) => Ok(vec![TValue::nil()]),
        Err(e) => Err(NativeError::Message(e.to_string())),
    }
}

fn lua_inext(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let t = check_table(ctx, "inext")?;
    let i = match ctx.arg(1).as_number() {
        Some(n) => n as i64 + 1,
        None => {
            return Err(NativeError::Message(format!(
                "invalid argument #2 to 'inext' (number expected, got {})",
                type_name(ctx.arg(1))
            )))
        }
    };
    let v = t.raw_geti(i);
    if v.is_nil() {
        Ok(vec![])
    } else {
        Ok(vec![TValue::from_number(i as f64), v])
    }
}

fn check_any(ctx: &NativeContext, name: &str) -> Result<(), NativeError> {
    if ctx.args.is_empty() {
        Err(NativeError::Message(format!(
            "missing argument #1 to '{name}'"
        )))
    } else {
        Ok(())
    }
}

fn lua_pairs(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    check_any(ctx, "pairs")?;
    Ok(vec![ctx.upvalue(0), ctx.arg(0), TValue::nil()])
}

fn lua_ipairs(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    check_any(ctx, "ipairs")?;
    Ok(vec![ctx.upvalue(0), ctx.arg(0), TValue::from_number(0.0)])
}
