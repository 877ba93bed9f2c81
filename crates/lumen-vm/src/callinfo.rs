//! Call frame information for the VM.

use lumen_core::gc::{GcIdx, LuaClosure};
use lumen_core::string::StringId;

// Flags for CallInfo boolean fields
const FLAG_RETURN: u8 = 1;
const FLAG_NATIVE: u8 = 2;

/// A call frame. All positions are offsets into `Vm::stack`.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Slot holding the called function; results are moved here.
    pub func: usize,
    /// First register.
    pub base: usize,
    /// One past the last register.
    pub top: usize,
    /// Next instruction to execute when this frame resumes.
    pub saved_pc: usize,
    /// Expected number of results (-1 = multi-return).
    pub nresults: i32,
    /// The running closure; None for native functions and the host frame.
    pub closure: Option<GcIdx<LuaClosure>>,
    /// Index into `Vm::protos` (meaningless without `closure`).
    pub proto_idx: usize,
    /// Register and key of a NAMECALL that found no method. The CALL on
    /// that register reports it by name.
    pub missing_method: Option<(usize, StringId)>,
    flags: u8,
}

impl CallInfo {
    pub fn new(func: usize, base: usize, top: usize, nresults: i32) -> Self {
        CallInfo {
            func,
            base,
            top,
            saved_pc: 0,
            nresults,
            closure: None,
            proto_idx: 0,
            missing_method: None,
            flags: 0,
        }
    }

    pub fn is_lua(&self) -> bool {
        self.closure.is_some()
    }

    /// Entered from the host: returning from it leaves the executor.
    #[inline(always)]
    pub fn is_return(&self) -> bool {
        self.flags & FLAG_RETURN != 0
    }

    #[inline(always)]
    pub fn set_return(&mut self, v: bool) {
        if v {
            self.flags |= FLAG_RETURN;
        } else {
            self.flags &= !FLAG_RETURN;
        }
    }

    /// Running native code.
    #[inline(always)]
    pub fn is_native(&self) -> bool {
        self.flags & FLAG_NATIVE != 0
    }

    #[inline(always)]
    pub fn set_native(&mut self, v: bool) {
        if v {
            self.flags |= FLAG_NATIVE;
        } else {
            self.flags &= !FLAG_NATIVE;
        }
    }
}
