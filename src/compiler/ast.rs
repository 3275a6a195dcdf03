//! The emitted expression tree (§9 design notes): a tagged variant with one
//! variant per node kind, explicit typed payloads, immutable once built.
//! Parameter references are arena indices rather than owned back-pointers,
//! so a lambda body can refer to its binder without creating a cycle.

use crate::compiler::tokens::Span;
use crate::compiler::types::Type;
use serde::{Deserialize, Serialize};

/// Index into the per-parse parameter arena (`let`/`script let` locals and
/// lambda parameters share one numbering space within a single parse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamId(pub usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Real(f64),
    Complex(f64, f64),
    Bool(bool),
    Str(String),
    Date(chrono::NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    DotMul,
    DotDiv,
    MatSolve,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    ElementOf,
    /// vector dot product, written `^` between two `DVector`s
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    /// `'` postfix: matrix transpose or complex conjugate
    Transpose,
}

/// Which namespace a call resolves against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallTarget {
    /// `receiver.method(...)`
    Instance(Box<Expr>),
    /// `Class::method(...)` or a root-class constructor `Class(...)`
    Class(String),
    /// bare call resolved against the `math` pseudo-class, e.g. `sin(x)`
    Bare,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexKind {
    /// `v[i]`, optionally counted from the end (`v[^1]`)
    Single { index: Box<Expr>, from_end: bool },
    /// `v[a:b]`
    Range {
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
    /// `M[r, c]`
    RowCol {
        row: Box<IndexKind>,
        col: Box<IndexKind>,
    },
    /// `v{i}`, bounds-clamping safe indexer
    Safe(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignTarget {
    /// a host-owned `set` variable
    SessionVar(String),
    /// a `let`-bound local
    Local(ParamId),
}

/// The expression tree handed back to the host. Every variant carries its
/// resolved `Type` and source `Span`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Constant(Constant, Type, Span),
    Parameter(ParamId, String, Type, Span),
    /// `name!` or a bare reference to a registered `def`
    DefRef(String, Type, Span),
    /// a reference to a live `set` session variable, resolved through the
    /// host data source at emission time
    SessionVar(String, Type, Span),

    UnaryOp(UnOp, Box<Expr>, Type, Span),
    BinaryOp(BinOp, Box<Expr>, Box<Expr>, Type, Span),

    /// explicit numeric widening inserted by the type checker
    Convert(Box<Expr>, Type, Span),

    Call {
        target: CallTarget,
        method: String,
        args: Vec<Expr>,
        ty: Type,
        span: Span,
    },

    New {
        class: String,
        args: Vec<Expr>,
        ty: Type,
        span: Span,
    },

    MemberAccess {
        object: Box<Expr>,
        property: String,
        ty: Type,
        span: Span,
    },

    Index {
        object: Box<Expr>,
        index: IndexKind,
        ty: Type,
        span: Span,
    },

    /// `if c1 then e1 elif c2 then e2 ... else eN`, kept as a branch list
    /// rather than desugared into nested ternaries so the emitted tree
    /// mirrors the surface grammar one-to-one.
    Condition {
        branches: Vec<(Expr, Expr)>,
        else_branch: Box<Expr>,
        ty: Type,
        span: Span,
    },

    Lambda {
        params: Vec<(String, ParamId)>,
        body: Box<Expr>,
        ty: Type,
        span: Span,
    },

    /// a sequence of statements (used for comma-separated `set` lists and
    /// `let ... in ...` locals before the final expression)
    Block(Vec<Expr>, Type, Span),

    Assign {
        target: AssignTarget,
        value: Box<Expr>,
        ty: Type,
        span: Span,
    },
}

impl Expr {
    pub fn ty(&self) -> &Type {
        match self {
            Expr::Constant(_, t, _)
            | Expr::Parameter(_, _, t, _)
            | Expr::DefRef(_, t, _)
            | Expr::SessionVar(_, t, _)
            | Expr::UnaryOp(_, _, t, _)
            | Expr::BinaryOp(_, _, _, t, _)
            | Expr::Convert(_, t, _)
            | Expr::Call { ty: t, .. }
            | Expr::New { ty: t, .. }
            | Expr::MemberAccess { ty: t, .. }
            | Expr::Index { ty: t, .. }
            | Expr::Condition { ty: t, .. }
            | Expr::Lambda { ty: t, .. }
            | Expr::Block(_, t, _)
            | Expr::Assign { ty: t, .. } => t,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Expr::Constant(_, _, s)
            | Expr::Parameter(_, _, _, s)
            | Expr::DefRef(_, _, s)
            | Expr::SessionVar(_, _, s)
            | Expr::UnaryOp(_, _, _, s)
            | Expr::BinaryOp(_, _, _, _, s)
            | Expr::Convert(_, _, s)
            | Expr::Call { span: s, .. }
            | Expr::New { span: s, .. }
            | Expr::MemberAccess { span: s, .. }
            | Expr::Index { span: s, .. }
            | Expr::Condition { span: s, .. }
            | Expr::Lambda { span: s, .. }
            | Expr::Block(_, _, s)
            | Expr::Assign { span: s, .. } => *s,
        }
    }
}

/// A registered `def` macro, per §6.3 — the only thing the host persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub source_text: String,
    pub description: Option<String>,
    pub expression: Expr,
    /// names of other `def`s this one references via `!`
    pub children: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_span() -> Span {
        Span::new(0, 0, 1, 1)
    }

    #[test]
    fn ty_and_span_dispatch_cover_every_variant() {
        let c = Expr::Constant(Constant::Int(1), Type::Int, dummy_span());
        assert_eq!(*c.ty(), Type::Int);

        let p = Expr::Parameter(ParamId(0), "x".into(), Type::Double, dummy_span());
        assert_eq!(*p.ty(), Type::Double);

        let wrapped = Expr::Convert(Box::new(p), Type::Complex, dummy_span());
        assert_eq!(*wrapped.ty(), Type::Complex);
    }
}
