//! Function prototypes.

use std::cell::Cell;

use lumen_core::string::StringId;
use lumen_core::value::TValue;

use crate::opcode::Insn;
use crate::vm::Vm;

/// Native code attached to a prototype.
///
/// Called with the context and the running frame's base. The frame to run
/// (or resume, at `CallInfo::saved_pc`) is the innermost one.
///
/// Returns [`NATIVE_DONE`] when a frame entered from the host has returned,
/// [`NATIVE_CONTINUE`] when the interpreter should pick up the innermost frame
/// at its saved pc, or a negative value when an error is pending in
/// `Vm::pending_error`.
pub type NativeEntry = unsafe extern "C" fn(vm: *mut Vm, base: usize) -> i64;

pub const NATIVE_DONE: i64 = 0;
pub const NATIVE_CONTINUE: i64 = 1;
pub const NATIVE_ERROR: i64 = -1;

#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    String(StringId),
    /// Closure over child prototype `protos[i]`, shared by DUPCLOSURE.
    Closure(usize),
}

/// A function prototype.
///
/// Built with nested children; `Vm::load` flattens the tree into the VM's
/// prototype store, filling `children` and `k`.
#[derive(Debug, Default)]
pub struct Proto {
    pub code: Vec<Insn>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Proto>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub num_upvalues: u8,
    pub name: Option<String>,
    pub native: Option<NativeEntry>,

    /// Store indices of the children, in `protos` order.
    pub children: Vec<usize>,
    /// Materialized constants.
    pub k: Vec<TValue>,
    /// Predicted hash slot per instruction (GETGLOBAL, GETTABLEKS, SETTABLEKS, NAMECALL).
    pub slot_hints: Vec<Cell<u32>>,
}

impl Proto {
    pub fn new(code: Vec<Insn>, constants: Vec<Constant>) -> Self {
        Proto {
            code,
            constants,
            max_stack_size: 8,
            ..Default::default()
        }
    }

    pub fn with_params(mut self, num_params: u8, is_vararg: bool) -> Self {
        self.num_params = num_params;
        self.is_vararg = is_vararg;
        self
    }

    pub fn with_stack(mut self, max_stack_size: u8) -> Self {
        self.max_stack_size = max_stack_size;
        self
    }

    pub fn with_upvalues(mut self, num_upvalues: u8) -> Self {
        self.num_upvalues = num_upvalues;
        self
    }

    pub fn with_children(mut self, protos: Vec<Proto>) -> Self {
        self.protos = protos;
        self
    }

    pub fn with_native(mut self, entry: NativeEntry) -> Self {
        self.native = Some(entry);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[inline(always)]
    pub fn slot_hint(&self, pc: usize) -> usize {
        self.slot_hints.get(pc).map_or(0, |c| c.get() as usize)
    }

    #[inline(always)]
    pub fn set_slot_hint(&self, pc: usize, slot: usize) {
        if let Some(c) = self.slot_hints.get(pc) {
            c.set(slot as u32);
        }
    }

    /// String constant `K[k]`.
    pub fn string_constant(&self, k: u32) -> Option<StringId> {
        match self.constants.get(k as usize) {
            Some(Constant::String(sid)) => Some(*sid),
            _ => None,
        }
    }
}
