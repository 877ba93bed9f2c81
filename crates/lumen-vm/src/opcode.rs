/// Decoded instruction set.
///
/// Operands that the packed form keeps in auxiliary words are plain fields
/// here. Registers are frame-relative (`base + a`). Jump offsets are relative
/// to the instruction after the jump, so the target of a jump at `pc` is
/// `pc + 1 + d`. Counts of `LUA_MULTRET` (-1) mean "up to `top`".
use std::fmt;

/// How a closure captures one upvalue. Always follows NEWCLOSURE/DUPCLOSURE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    /// Copy of a register.
    Val,
    /// Shared cell over a register.
    Ref,
    /// The enclosing closure's upvalue reference.
    Upval,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Insn {
    Nop,
    Move { a: u8, b: u8 },
    LoadNil { a: u8 },
    /// R[a] = value; skip `skip` instructions.
    LoadB { a: u8, value: bool, skip: u8 },
    LoadN { a: u8, n: i16 },
    LoadK { a: u8, k: u32 },

    /// R[a] = env[K[k]]
    GetGlobal { a: u8, k: u32 },
    /// env[K[k]] = R[a]
    SetGlobal { a: u8, k: u32 },
    GetUpval { a: u8, u: u8 },
    SetUpval { a: u8, u: u8 },
    /// Close every open upvalue at or above R[a].
    CloseUpvals { a: u8 },

    /// R[a] = R[b][R[c]]
    GetTable { a: u8, b: u8, c: u8 },
    /// R[b][R[c]] = R[a]
    SetTable { a: u8, b: u8, c: u8 },
    /// R[a] = R[b][K[k]], K[k] a string
    GetTableKs { a: u8, b: u8, k: u32 },
    /// R[b][K[k]] = R[a]
    SetTableKs { a: u8, b: u8, k: u32 },
    /// R[a] = R[b][n + 1]
    GetTableN { a: u8, b: u8, n: u8 },
    /// R[b][n + 1] = R[a]
    SetTableN { a: u8, b: u8, n: u8 },

    /// R[a] = closure over child prototype `d`, followed by its captures.
    NewClosure { a: u8, d: u16 },
    /// R[a] = closure constant K[k], followed by its captures.
    DupClosure { a: u8, k: u32 },
    Capture { kind: CaptureKind, b: u8 },

    /// R[a+1] = R[b]; R[a] = R[b][K[k]]. Always followed by CALL.
    NameCall { a: u8, b: u8, k: u32 },
    /// Call R[a] with `nargs` arguments, keeping `nresults` results.
    Call { a: u8, nargs: i32, nresults: i32 },
    /// Return `count` values starting at R[a].
    Return { a: u8, count: i32 },

    Jump { d: i32 },
    JumpIf { a: u8, d: i32 },
    JumpIfNot { a: u8, d: i32 },

    Add { a: u8, b: u8, c: u8 },
    Sub { a: u8, b: u8, c: u8 },
    /// R[a] = R[b] + K[k]
    AddK { a: u8, b: u8, k: u32 },

    NewTable { a: u8, array_size: u32, hash_size: u32 },
    /// R[a][index + i - 1] = R[b + i - 1] for i in 1..=count.
    SetList { a: u8, b: u8, count: i32, index: u32 },

    /// Prepare a generic for over R[a..a+3]; jump to the FORGLOOP at `pc + 1 + d`.
    ForGPrep { a: u8, d: i32 },
    /// FORGPREP specialized for `pairs`/`next`.
    ForGPrepNext { a: u8, d: i32 },
    /// FORGPREP specialized for `ipairs`.
    ForGPrepINext { a: u8, d: i32 },
    /// Advance the loop; jump back to `pc + 1 + d` while it produces values.
    ForGLoop { a: u8, d: i32, nvars: u8, ipairs: bool },

    /// Copy `count` varargs to R[a..].
    GetVarArgs { a: u8, count: i32 },
    /// Entry of a vararg function: move the fixed parameters above the varargs.
    PrepVarArgs { num_params: u8 },
}

impl Insn {
    pub fn name(&self) -> &'static str {
        match self {
            Insn::Nop => "NOP",
            Insn::Move { .. } => "MOVE",
            Insn::LoadNil { .. } => "LOADNIL",
            Insn::LoadB { .. } => "LOADB",
            Insn::LoadN { .. } => "LOADN",
            Insn::LoadK { .. } => "LOADK",
            Insn::GetGlobal { .. } => "GETGLOBAL",
            Insn::SetGlobal { .. } => "SETGLOBAL",
            Insn::GetUpval { .. } => "GETUPVAL",
            Insn::SetUpval { .. } => "SETUPVAL",
            Insn::CloseUpvals { .. } => "CLOSEUPVALS",
            Insn::GetTable { .. } => "GETTABLE",
            Insn::SetTable { .. } => "SETTABLE",
            Insn::GetTableKs { .. } => "GETTABLEKS",
            Insn::SetTableKs { .. } => "SETTABLEKS",
            Insn::GetTableN { .. } => "GETTABLEN",
            Insn::SetTableN { .. } => "SETTABLEN",
            Insn::NewClosure { .. } => "NEWCLOSURE",
            Insn::DupClosure { .. } => "DUPCLOSURE",
            Insn::Capture { .. } => "CAPTURE",
            Insn::NameCall { .. } => "NAMECALL",
            Insn::Call { .. } => "CALL",
            Insn::Return { .. } => "RETURN",
            Insn::Jump { .. } => "JUMP",
            Insn::JumpIf { .. } => "JUMPIF",
            Insn::JumpIfNot { .. } => "JUMPIFNOT",
            Insn::Add { .. } => "ADD",
            Insn::Sub { .. } => "SUB",
            Insn::AddK { .. } => "ADDK",
            Insn::NewTable { .. } => "NEWTABLE",
            Insn::SetList { .. } => "SETLIST",
            Insn::ForGPrep { .. } => "FORGPREP",
            Insn::ForGPrepNext { .. } => "FORGPREP_NEXT",
            Insn::ForGPrepINext { .. } => "FORGPREP_INEXT",
            Insn::ForGLoop { .. } => "FORGLOOP",
            Insn::GetVarArgs { .. } => "GETVARARGS",
            Insn::PrepVarArgs { .. } => "PREPVARARGS",
        }
    }
}

/// Target of a relative jump encoded at `pc`.
#[inline(always)]
pub fn jump_target(pc: usize, d: i32) -> usize {
    (pc as i64 + 1 + d as i64) as usize
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Debug already prints the operands by name.
        let dbg = format!("{self:?}");
        match dbg.find(' ') {
            Some(i) => write!(f, "{}{}", self.name(), &dbg[i..]),
            None => write!(f, "{}", self.name()),
        }
    }
}
