//! Syntax tree stored in a caller-owned arena.

use crate::location::Location;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StatId(pub u32);

/// Identity of any node, used to key side tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeId {
    Expr(ExprId),
    Stat(StatId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
    Len,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    CompareNe,
    CompareEq,
    CompareLt,
    CompareLe,
    CompareGt,
    CompareGe,
    And,
    Or,
}

impl BinaryOp {
    /// (left, right) binding power.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinaryOp::Add | BinaryOp::Sub => (6, 6),
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => (7, 7),
            BinaryOp::Pow => (10, 9),
            BinaryOp::Concat => (5, 4),
            BinaryOp::CompareNe
            | BinaryOp::CompareEq
            | BinaryOp::CompareLt
            | BinaryOp::CompareLe
            | BinaryOp::CompareGt
            | BinaryOp::CompareGe => (3, 3),
            BinaryOp::And => (2, 2),
            BinaryOp::Or => (1, 1),
        }
    }
}

pub const UNARY_PRIORITY: u8 = 8;

#[derive(Clone, Debug, PartialEq)]
pub enum TableItem {
    /// Positional item.
    List(ExprId),
    /// `name = value`
    Record { key: String, value: ExprId },
    /// `[key] = value`
    General { key: ExprId, value: ExprId },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Varargs,
    Name(String),
    Group(ExprId),
    Call {
        func: ExprId,
        args: Vec<ExprId>,
        /// `a:b(...)` form.
        self_call: bool,
    },
    IndexName {
        expr: ExprId,
        index: String,
        /// `.` or `:`
        op: char,
    },
    IndexExpr {
        expr: ExprId,
        index: ExprId,
    },
    Function {
        params: Vec<String>,
        vararg: bool,
        body: StatId,
    },
    Table(Vec<TableItem>),
    Unary {
        op: UnaryOp,
        expr: ExprId,
    },
    Binary {
        op: BinaryOp,
        left: ExprId,
        right: ExprId,
    },
    /// Recovery node. `message_index` points into the parse error list.
    Error {
        exprs: Vec<ExprId>,
        message_index: usize,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: Location,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatKind {
    Block(Vec<StatId>),
    If {
        condition: ExprId,
        then_body: StatId,
        else_body: Option<StatId>,
    },
    While {
        condition: ExprId,
        body: StatId,
    },
    Repeat {
        body: StatId,
        condition: ExprId,
    },
    Break,
    Continue,
    Return(Vec<ExprId>),
    Expr(ExprId),
    Local {
        names: Vec<String>,
        values: Vec<ExprId>,
    },
    For {
        var: String,
        from: ExprId,
        to: ExprId,
        step: Option<ExprId>,
        body: StatId,
    },
    ForIn {
        vars: Vec<String>,
        values: Vec<ExprId>,
        body: StatId,
    },
    Assign {
        targets: Vec<ExprId>,
        values: Vec<ExprId>,
    },
    Function {
        name: ExprId,
        func: ExprId,
    },
    LocalFunction {
        name: String,
        func: ExprId,
    },
    /// Recovery node. `message_index` points into the parse error list.
    Error {
        exprs: Vec<ExprId>,
        stats: Vec<StatId>,
        message_index: usize,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stat {
    pub kind: StatKind,
    pub location: Location,
    pub has_semicolon: bool,
}

/// Owns every node produced by one or more parses.
#[derive(Debug, Default)]
pub struct AstArena {
    exprs: Vec<Expr>,
    stats: Vec<Stat>,
}

impl AstArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_expr(&mut self, kind: ExprKind, location: Location) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expr { kind, location });
        id
    }

    pub fn alloc_stat(&mut self, kind: StatKind, location: Location) -> StatId {
        let id = StatId(self.stats.len() as u32);
        self.stats.push(Stat {
            kind,
            location,
            has_semicolon: false,
        });
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn stat(&self, id: StatId) -> &Stat {
        &self.stats[id.0 as usize]
    }

    pub fn stat_mut(&mut self, id: StatId) -> &mut Stat {
        &mut self.stats[id.0 as usize]
    }

    pub fn location(&self, node: NodeId) -> Location {
        match node {
            NodeId::Expr(e) => self.expr(e).location,
            NodeId::Stat(s) => self.stat(s).location,
        }
    }

    /// Statements of a block node; empty for anything else.
    pub fn block_body(&self, id: StatId) -> &[StatId] {
        match &self.stat(id).kind {
            StatKind::Block(body) => body,
            _ => &[],
        }
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    pub fn stat_count(&self) -> usize {
        self.stats.len()
    }
}
