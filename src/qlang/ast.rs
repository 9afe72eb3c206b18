//! Typed syntax tree produced by the parser.
//!
//! Nodes carry the span of their first token so later passes can anchor
//! diagnostics. The tree is serializable; a parse-validated tree is what the
//! module codec embeds as the portable program image.

use {
    super::token::Span,
    serde::{Deserialize, Serialize},
};

/// A named type as written in source: a primitive keyword or a class name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeName {
    pub name: String,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Program {
    pub classes: Vec<ClassDecl>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassDecl {
    pub name: String,
    pub parent_name: Option<String>,
    pub members: Vec<MemberDecl>,
    pub methods: Vec<MethodDecl>,
    pub is_static: bool,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberDecl {
    pub name: String,
    pub ty: TypeName,
    pub init: Option<Expr>,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodDecl {
    pub name: String,
    pub params: Vec<Param>,
    /// Declared return type; `None` means the method returns nothing
    /// (reported as "null" in metadata).
    pub return_type: Option<TypeName>,
    pub body: Block,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeName,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Stmt {
    Block(Block),
    VarDecl {
        name: String,
        ty: TypeName,
        init: Option<Expr>,
        span: Span,
    },
    Assign {
        target: Expr,
        value: Expr,
        span: Span,
    },
    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
        span: Span,
    },
    While {
        cond: Expr,
        body: Block,
        span: Span,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Block,
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Expr {
        expr: Expr,
        span: Span,
    },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Self::Block(b) => b.span,
            Self::VarDecl { span, .. }
            | Self::Assign { span, .. }
            | Self::If { span, .. }
            | Self::While { span, .. }
            | Self::For { span, .. }
            | Self::Return { span, .. }
            | Self::Expr { span, .. } => *span,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Expr {
    Literal {
        value: Literal,
        span: Span,
    },
    Ident {
        name: String,
        span: Span,
    },
    /// `base.member`
    Member {
        base: Box<Expr>,
        member: String,
        span: Span,
    },
    /// Free call `f(args)` resolves to a native function; `base.m(args)` is
    /// a method dispatch on the base's static class.
    Call {
        base: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    /// Explicit numeric conversion: `int32(x)`, `float64(n)`, ...
    Cast {
        ty: TypeName,
        operand: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Self::Literal { span, .. }
            | Self::Ident { span, .. }
            | Self::Member { span, .. }
            | Self::Call { span, .. }
            | Self::Binary { span, .. }
            | Self::Unary { span, .. }
            | Self::Cast { span, .. } => *span,
        }
    }
}
