//! Lumen fallback bridge: the slow paths native code delegates to.
//!
//! Every operation here has the same observable effect as the interpreter
//! executing the corresponding instruction. Native code calls them through
//! the `extern "C"` shims in [`runtime`]; Rust callers use the typed
//! functions directly.

pub mod abi;
pub mod call;
pub mod dispatch;
pub mod fallback;
pub mod forg;
pub mod runtime;
pub mod vararg;

pub use dispatch::FallbackOp;
pub use fallback::NextPc;
pub use runtime::SIDE_EXIT;
