//! Type name helpers.

use crate::gc::*;
use crate::value::TValue;

/// The Luau type name of a value.
pub fn type_name(val: TValue) -> &'static str {
    if val.is_nil() {
        "nil"
    } else if val.is_bool() {
        "boolean"
    } else if val.is_number() {
        "number"
    } else if val.is_light_userdata() {
        "userdata"
    } else {
        match val.gc_sub_tag() {
            Some(GC_SUB_TABLE) => "table",
            Some(GC_SUB_CLOSURE) | Some(GC_SUB_NATIVE) => "function",
            Some(GC_SUB_STRING) => "string",
            Some(GC_SUB_THREAD) => "thread",
            _ => "userdata",
        }
    }
}
