use lumen_core::gc::GC_MIN_THRESHOLD;

use crate::limits::{BASIC_STACK_SIZE, LUAI_MAXCALLS, LUAI_MAXCCALLS, LUAI_MAXSTACK, MAX_TAG_LOOP};

/// Runtime-overridable limits and execution switches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmOptions {
    pub max_stack_size: usize,
    pub max_call_depth: usize,
    pub max_c_calls: usize,
    pub max_tag_loop: usize,
    pub initial_stack_size: usize,
    /// Enter attached native entry points. When false every frame is interpreted.
    pub native_enabled: bool,
    /// Every fallback hands control back to the interpreter after one instruction.
    pub single_step: bool,
    /// Allocations before the first collection, and the floor for later ones.
    pub gc_min_threshold: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            max_stack_size: LUAI_MAXSTACK,
            max_call_depth: LUAI_MAXCALLS,
            max_c_calls: LUAI_MAXCCALLS,
            max_tag_loop: MAX_TAG_LOOP,
            initial_stack_size: BASIC_STACK_SIZE,
            native_enabled: true,
            single_step: false,
            gc_min_threshold: GC_MIN_THRESHOLD,
        }
    }
}
