// ABOUTME: Abstract syntax tree for parsed templates

use crate::token::Span;
use std::sync::Arc;

/// A parsed template: a flat ordered sequence of top-level nodes.
///
/// Immutable once built. Macro and call-block bodies are held behind `Arc`
/// because they escape into closure values at render time; everything else
/// is plain owned data, so a `Program` can be shared between threads and
/// rendered concurrently with independent environments.
#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Stmt>,
}

/// Scalar literal that survives in the AST (and that constant folding folds
/// down to). Container literals stay as constructor expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

/// One argument at a call site.
#[derive(Debug, Clone)]
pub enum Arg {
    Pos(Expr),
    Kw(String, Expr),
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Var(String),
    Array(Vec<Expr>),
    /// Map literal; keys are expressions and are stringified at build time
    Map(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `a if cond else b`; a missing else-arm yields undefined on a false
    /// condition
    Ternary {
        then: Box<Expr>,
        cond: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    /// `value | name(args)`
    Filter {
        value: Box<Expr>,
        name: String,
        args: Vec<Arg>,
    },
    /// `value is [not] name(args)`
    Test {
        value: Box<Expr>,
        name: String,
        args: Vec<Arg>,
        negated: bool,
    },
    /// Dot access `base.name`
    Attr {
        base: Box<Expr>,
        name: String,
    },
    /// Computed access `base[key]`
    Index {
        base: Box<Expr>,
        key: Box<Expr>,
    },
    /// `base[start:stop:step]`
    Slice {
        base: Box<Expr>,
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
}

/// Binding pattern of a `for` target or tuple `set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopTarget {
    Name(String),
    Tuple(Vec<String>),
}

/// One `name[=default]` macro parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// A macro declaration; shared between the AST node and the closure value a
/// render binds for it.
#[derive(Debug, Clone)]
pub struct MacroDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// One filter application inside a `{% filter %}` chain.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub name: String,
    pub args: Vec<Arg>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    /// Verbatim template text
    Text(String),
    /// `{{ expr }}`
    Emit(Expr),
    /// `{% set name = expr %}` / `{% set a, b = expr %}`
    Set {
        target: LoopTarget,
        value: Expr,
        span: Span,
    },
    /// `{% set ns.attr = expr %}`: member-store on a shared map
    SetAttr {
        name: String,
        path: Vec<String>,
        value: Expr,
        span: Span,
    },
    /// `{% set name %}…{% endset %}`: captures the rendered body
    SetBlock {
        name: String,
        body: Vec<Stmt>,
        span: Span,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: Span,
    },
    For {
        target: LoopTarget,
        iterable: Expr,
        filter: Option<Expr>,
        body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: Span,
    },
    Macro(Arc<MacroDecl>),
    /// `{% filter name %}…{% endfilter %}`
    FilterBlock {
        filters: Vec<FilterSpec>,
        body: Vec<Stmt>,
        span: Span,
    },
    /// `{% call macro(args) %}…{% endcall %}`
    CallBlock {
        call: Expr,
        body: Arc<Vec<Stmt>>,
        span: Span,
    },
    Break(Span),
    Continue(Span),
}
