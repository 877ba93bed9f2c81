//! Hard limits shared by the interpreter and the native fallbacks.

/// "All values": variable argument/result count.
pub const LUA_MULTRET: i32 = -1;

/// Free slots guaranteed to a native function.
pub const LUA_MINSTACK: usize = 20;

/// Slack kept above `top` so metamethod calls can push a few values unchecked.
pub const EXTRA_STACK: usize = 5;

pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;

/// Largest value stack, in slots.
pub const LUAI_MAXSTACK: usize = 1_000_000;

/// Deepest frame stack.
pub const LUAI_MAXCALLS: usize = 20_000;

/// Deepest nesting of host-level calls (metamethods, iterators, `call_value`).
pub const LUAI_MAXCCALLS: usize = 200;

/// Longest `__index`/`__newindex`/`__call` chain followed before giving up.
pub const MAX_TAG_LOOP: usize = 100;

/// String keys longer than this are reported by type in index errors.
pub const MAX_KEY_IN_MESSAGE: usize = 64;
