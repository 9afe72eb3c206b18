//! Token stream produced by the tokenizer.

use std::fmt;

/// Numeric subtype carried by literal tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumberKind {
    Int32,
    Int64,
    Float32,
    Float64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // Keywords
    Class,
    Extends,
    Static,
    Func,
    Return,
    If,
    Else,
    While,
    For,
    True,
    False,
    Null,

    // Primitive type names (also reserved)
    TyInt32,
    TyInt64,
    TyFloat32,
    TyFloat64,
    TyBool,
    TyString,
    TyCPtr,
    TyIPtr,
    TyFPtr,
    TyBPtr,

    // Literals
    Number(NumberKind),
    Str,

    Ident,

    // Punctuation and operators
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Colon,
    Dot,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    AndAnd,
    OrOr,

    Eof,
}

impl TokenKind {
    pub fn is_type_name(self) -> bool {
        matches!(
            self,
            Self::TyInt32
                | Self::TyInt64
                | Self::TyFloat32
                | Self::TyFloat64
                | Self::TyBool
                | Self::TyString
                | Self::TyCPtr
                | Self::TyIPtr
                | Self::TyFPtr
                | Self::TyBPtr
        )
    }
}

/// A lexed token. `lexeme` is the exact source text; `offset` is the byte
/// position of its first character, kept so the token stream can be stitched
/// back into source text.
#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    /// Unescaped payload for string literals; empty otherwise.
    pub string_value: String,
    pub offset: usize,
    pub line: u32,
    pub column: u32,
}

impl Token {
    pub fn eof(offset: usize, line: u32, column: u32) -> Self {
        Self {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            string_value: String::new(),
            offset,
            line,
            column,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?} @{}:{}", self.kind, self.lexeme, self.line, self.column)
    }
}

/// Source span recorded on AST nodes: the position of the node's first token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn of(token: &Token) -> Self {
        Self {
            line: token.line,
            column: token.column,
        }
    }
}
