//! Metatable-aware table access.

use lumen_core::value::TValue;
use tracing::debug;

use crate::call::{call_tm, call_tm_res};
use crate::error::{index_error, readonly_error, LuaError};
use crate::metamethod::{fast_tm, get_metamethod, Tm};
use crate::vm::Vm;

/// `t[key]` with `__index` handling.
///
/// A miss on a table consults `__index`: a function is called with
/// `(t, key)` and its first result is returned, anything else is indexed in
/// turn. Chains longer than `max_tag_loop` are an error.
pub fn get_table(vm: &mut Vm, t: TValue, key: TValue) -> Result<TValue, LuaError> {
    let mut t = t;
    for _ in 0..vm.options.max_tag_loop {
        let tm = if let Some(h) = t.as_table_idx() {
            let table = vm.gc.get_table(h);
            let res = table.raw_get(key);
            if !res.is_nil() {
                return Ok(res);
            }
            match fast_tm(&vm.gc, &vm.mm_names, table.metatable, Tm::Index) {
                Some(tm) => tm,
                None => return Ok(TValue::nil()),
            }
        } else {
            match get_metamethod(&vm.gc, &vm.mm_names, t, Tm::Index) {
                Some(tm) => tm,
                None => return Err(index_error(t, key, &vm.strings)),
            }
        };
        if tm.is_function() {
            return call_tm_res(vm, tm, t, key);
        }
        t = tm;
    }
    debug!(target: "lumen::vm::index", limit = vm.options.max_tag_loop, "__index chain cap hit");
    Err(LuaError::runtime("'__index' chain too long; possible loop"))
}

/// `t[key] = val` with `__newindex` handling.
///
/// `__newindex` is only consulted when the key has no value yet. Readonly
/// tables reject the raw assignment.
pub fn set_table(vm: &mut Vm, t: TValue, key: TValue, val: TValue) -> Result<(), LuaError> {
    let mut t = t;
    for _ in 0..vm.options.max_tag_loop {
        let tm = if let Some(h) = t.as_table_idx() {
            let table = vm.gc.get_table(h);
            let tm = if table.raw_get(key).is_nil() {
                fast_tm(&vm.gc, &vm.mm_names, table.metatable, Tm::NewIndex)
            } else {
                None
            };
            match tm {
                Some(tm) => tm,
                None => {
                    if table.readonly {
                        return Err(readonly_error());
                    }
                    vm.gc.get_table_mut(h).raw_set(key, val)?;
                    return Ok(());
                }
            }
        } else {
            match get_metamethod(&vm.gc, &vm.mm_names, t, Tm::NewIndex) {
                Some(tm) => tm,
                None => return Err(index_error(t, key, &vm.strings)),
            }
        };
        if tm.is_function() {
            return call_tm(vm, tm, t, key, val);
        }
        t = tm;
    }
    debug!(target: "lumen::vm::index", limit = vm.options.max_tag_loop, "__newindex chain cap hit");
    Err(LuaError::runtime("'__newindex' chain too long; possible loop"))
}
