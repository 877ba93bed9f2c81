//! Opcode to fallback mapping.

use lumen_vm::error::LuaError;
use lumen_vm::opcode::Insn;
use lumen_vm::vm::Vm;
use tracing::trace;

use crate::fallback::{self, NextPc, SLOWPATH};
use crate::{forg, vararg};

/// Every instruction native code may delegate wholesale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FallbackOp {
    GetGlobal,
    SetGlobal,
    GetTableKs,
    SetTableKs,
    NameCall,
    NewClosure,
    DupClosure,
    SetList,
    GetVarArgs,
    PrepVarArgs,
    ForGPrep,
    ForGPrepNext,
    ForGPrepINext,
    ForGLoop,
}

impl FallbackOp {
    pub const ALL: [FallbackOp; 14] = [
        FallbackOp::GetGlobal,
        FallbackOp::SetGlobal,
        FallbackOp::GetTableKs,
        FallbackOp::SetTableKs,
        FallbackOp::NameCall,
        FallbackOp::NewClosure,
        FallbackOp::DupClosure,
        FallbackOp::SetList,
        FallbackOp::GetVarArgs,
        FallbackOp::PrepVarArgs,
        FallbackOp::ForGPrep,
        FallbackOp::ForGPrepNext,
        FallbackOp::ForGPrepINext,
        FallbackOp::ForGLoop,
    ];

    /// The fallback for `insn`, if it has one.
    pub fn for_insn(insn: &Insn) -> Option<FallbackOp> {
        Some(match insn {
            Insn::GetGlobal { .. } => FallbackOp::GetGlobal,
            Insn::SetGlobal { .. } => FallbackOp::SetGlobal,
            Insn::GetTableKs { .. } => FallbackOp::GetTableKs,
            Insn::SetTableKs { .. } => FallbackOp::SetTableKs,
            Insn::NameCall { .. } => FallbackOp::NameCall,
            Insn::NewClosure { .. } => FallbackOp::NewClosure,
            Insn::DupClosure { .. } => FallbackOp::DupClosure,
            Insn::SetList { .. } => FallbackOp::SetList,
            Insn::GetVarArgs { .. } => FallbackOp::GetVarArgs,
            Insn::PrepVarArgs { .. } => FallbackOp::PrepVarArgs,
            Insn::ForGPrep { .. } => FallbackOp::ForGPrep,
            Insn::ForGPrepNext { .. } => FallbackOp::ForGPrepNext,
            Insn::ForGPrepINext { .. } => FallbackOp::ForGPrepINext,
            Insn::ForGLoop { .. } => FallbackOp::ForGLoop,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            FallbackOp::GetGlobal => "GETGLOBAL",
            FallbackOp::SetGlobal => "SETGLOBAL",
            FallbackOp::GetTableKs => "GETTABLEKS",
            FallbackOp::SetTableKs => "SETTABLEKS",
            FallbackOp::NameCall => "NAMECALL",
            FallbackOp::NewClosure => "NEWCLOSURE",
            FallbackOp::DupClosure => "DUPCLOSURE",
            FallbackOp::SetList => "SETLIST",
            FallbackOp::GetVarArgs => "GETVARARGS",
            FallbackOp::PrepVarArgs => "PREPVARARGS",
            FallbackOp::ForGPrep => "FORGPREP",
            FallbackOp::ForGPrepNext => "FORGPREP_NEXT",
            FallbackOp::ForGPrepINext => "FORGPREP_INEXT",
            FallbackOp::ForGLoop => "FORGLOOP",
        }
    }

    /// Execute the instruction at `pc` of the innermost frame.
    pub fn run(self, vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
        trace!(target: SLOWPATH, op = self.name(), pc, base, "fallback");
        match self {
            FallbackOp::GetGlobal => fallback::get_global(vm, pc, base),
            FallbackOp::SetGlobal => fallback::set_global(vm, pc, base),
            FallbackOp::GetTableKs => fallback::get_table_ks(vm, pc, base),
            FallbackOp::SetTableKs => fallback::set_table_ks(vm, pc, base),
            FallbackOp::NameCall => fallback::namecall(vm, pc, base),
            FallbackOp::NewClosure => fallback::new_closure(vm, pc, base),
            FallbackOp::DupClosure => fallback::dup_closure(vm, pc, base),
            FallbackOp::SetList => fallback::set_list(vm, pc, base),
            FallbackOp::GetVarArgs => vararg::get_varargs(vm, pc, base),
            FallbackOp::PrepVarArgs => vararg::prep_varargs(vm, pc, base),
            FallbackOp::ForGPrep => forg::forg_prep(vm, pc, base),
            FallbackOp::ForGPrepNext => forg::forg_prep_next(vm, pc, base),
            FallbackOp::ForGPrepINext => forg::forg_prep_inext(vm, pc, base),
            FallbackOp::ForGLoop => forg::forg_loop(vm, pc, base),
        }
    }
}

/// Run whatever fallback the instruction at `pc` has.
pub fn run_at(vm: &mut Vm, pc: usize, base: usize) -> Result<NextPc, LuaError> {
    let frame = fallback::Frame::current(vm)?;
    let insn = frame.fetch(pc)?;
    match FallbackOp::for_insn(&insn) {
        Some(op) => op.run(vm, pc, base),
        None => Err(LuaError::runtime(format!(
            "{} at pc {pc} has no fallback",
            insn.name()
        ))),
    }
}
