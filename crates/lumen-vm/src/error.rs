//! Runtime error type.

use lumen_core::gc::NativeError;
use lumen_core::object::type_name;
use lumen_core::string::StringInterner;
use lumen_core::table::TableError;
use lumen_core::value::TValue;

use crate::limits::MAX_KEY_IN_MESSAGE;

/// A runtime error. Propagated with `?` and recovered only at `call::pcall`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LuaError {
    #[error("{0}")]
    Runtime(String),
    #[error("stack overflow")]
    StackOverflow,
    #[error("C stack overflow")]
    CStackOverflow,
    /// An arbitrary error value raised by a native function.
    #[error("error object is a {} value", value_type(.0))]
    Value(TValue),
}

fn value_type(v: &TValue) -> &'static str {
    type_name(*v)
}

impl LuaError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        LuaError::Runtime(msg.into())
    }

    /// The error as a value, as seen by a protected caller.
    pub fn to_tvalue(&self, strings: &mut StringInterner) -> TValue {
        match self {
            LuaError::Value(v) => *v,
            other => TValue::from_string_id(strings.intern(other.to_string().as_bytes())),
        }
    }
}

impl From<TableError> for LuaError {
    fn from(e: TableError) -> Self {
        LuaError::Runtime(e.to_string())
    }
}

impl From<NativeError> for LuaError {
    fn from(e: NativeError) -> Self {
        match e {
            NativeError::Message(msg) => LuaError::Runtime(msg),
            NativeError::Value(v) => LuaError::Value(v),
        }
    }
}

/// `attempt to index <type> with '<key>'`, or with the key's type for
/// non-string and long keys.
pub fn index_error(obj: TValue, key: TValue, strings: &StringInterner) -> LuaError {
    let t = type_name(obj);
    match key.as_string_id() {
        Some(sid) if strings.get_bytes(sid).len() <= MAX_KEY_IN_MESSAGE => {
            LuaError::Runtime(format!("attempt to index {t} with '{}'", strings.get_lossy(sid)))
        }
        _ => LuaError::Runtime(format!("attempt to index {t} with {}", type_name(key))),
    }
}

/// `attempt to <op> a <type> value`
pub fn type_error(obj: TValue, op: &str) -> LuaError {
    LuaError::Runtime(format!("attempt to {op} a {} value", type_name(obj)))
}

pub fn arith_error(a: TValue, b: TValue) -> LuaError {
    let bad = if a.is_number() { b } else { a };
    type_error(bad, "perform arithmetic on")
}

pub fn method_error(receiver: TValue, method: &str) -> LuaError {
    LuaError::Runtime(format!(
        "attempt to call missing method '{method}' of {}",
        type_name(receiver)
    ))
}

pub fn readonly_error() -> LuaError {
    LuaError::runtime("attempt to modify a readonly table")
}
