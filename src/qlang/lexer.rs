//! Source text to token stream.

use {
    super::{
        diag::Diagnostics,
        token::{NumberKind, Token, TokenKind},
    },
    std::{fs, path::Path},
};

/// Converts a source buffer into tokens, accumulating diagnostics instead of
/// failing. The resulting sequence always ends with an EOF token.
pub struct Tokenizer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
}

/// Tokenize a file on disk. IO failures surface as a single diagnostic at 1:1.
pub fn tokenize_file(path: impl AsRef<Path>, diags: &mut Diagnostics) -> Vec<Token> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(src) => tokenize(&src, diags),
        Err(err) => {
            diags.error(1, 1, format!("cannot read {}: {err}", path.display()));
            vec![Token::eof(0, 1, 1)]
        }
    }
}

/// Tokenize an in-memory buffer.
pub fn tokenize(src: &str, diags: &mut Diagnostics) -> Vec<Token> {
    Tokenizer::new(src).run(diags)
}

impl<'a> Tokenizer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
        }
    }

    fn run(mut self, diags: &mut Diagnostics) -> Vec<Token> {
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => self.advance(),
                b'/' if self.peek(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment(diags),
                b'"' => self.lex_string(diags),
                b'0'..=b'9' => self.lex_number(),
                b'A'..=b'Z' | b'a'..=b'z' | b'_' => self.lex_ident(),
                _ => self.lex_operator(diags),
            }
        }
        self.tokens.push(Token::eof(self.pos, self.line, self.column));
        self.tokens
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn advance(&mut self) {
        if self.src[self.pos] == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        self.pos += 1;
    }

    fn skip_line_comment(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
            self.advance();
        }
    }

    fn skip_block_comment(&mut self, diags: &mut Diagnostics) {
        let (line, column) = (self.line, self.column);
        self.advance(); // '/'
        self.advance(); // '*'
        loop {
            if self.pos >= self.src.len() {
                diags.error(line, column, "unterminated block comment");
                return;
            }
            if self.src[self.pos] == b'*' && self.peek(1) == Some(b'/') {
                self.advance();
                self.advance();
                return;
            }
            self.advance();
        }
    }

    /// On a malformed token, consume up to the next whitespace so lexing can
    /// continue from a clean boundary.
    fn skip_to_whitespace(&mut self) {
        while self.pos < self.src.len() && !self.src[self.pos].is_ascii_whitespace() {
            self.advance();
        }
    }

    fn push(&mut self, kind: TokenKind, start: usize, line: u32, column: u32) {
        self.push_with_value(kind, start, line, column, String::new());
    }

    fn push_with_value(
        &mut self,
        kind: TokenKind,
        start: usize,
        line: u32,
        column: u32,
        string_value: String,
    ) {
        let lexeme = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        self.tokens.push(Token {
            kind,
            lexeme,
            string_value,
            offset: start,
            line,
            column,
        });
    }

    fn lex_string(&mut self, diags: &mut Diagnostics) {
        let (start, line, column) = (self.pos, self.line, self.column);
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.src.get(self.pos).copied() {
                None | Some(b'\n') => {
                    diags.error(line, column, "unterminated string literal");
                    self.skip_to_whitespace();
                    return;
                }
                Some(b'"') => {
                    self.advance();
                    self.push_with_value(TokenKind::Str, start, line, column, value);
                    return;
                }
                Some(b'\\') => {
                    self.advance();
                    let escaped = match self.src.get(self.pos).copied() {
                        Some(b'n') => '\n',
                        Some(b't') => '\t',
                        Some(b'r') => '\r',
                        Some(b'"') => '"',
                        Some(b'\\') => '\\',
                        other => {
                            diags.error(
                                self.line,
                                self.column,
                                format!(
                                    "invalid escape sequence '\\{}'",
                                    other.map(|c| c as char).unwrap_or(' ')
                                ),
                            );
                            '\\'
                        }
                    };
                    value.push(escaped);
                    if self.pos < self.src.len() {
                        self.advance();
                    }
                }
                Some(c) => {
                    value.push(c as char);
                    self.advance();
                }
            }
        }
    }

    fn lex_number(&mut self) {
        let (start, line, column) = (self.pos, self.line, self.column);
        let mut is_float = false;
        while let Some(c) = self.src.get(self.pos).copied() {
            match c {
                b'0'..=b'9' => self.advance(),
                b'.' if !is_float && matches!(self.peek(1), Some(b'0'..=b'9')) => {
                    is_float = true;
                    self.advance();
                }
                _ => break,
            }
        }
        // Suffix disambiguation: 1.5f -> float32, 10L -> int64.
        let kind = match self.src.get(self.pos).copied() {
            Some(b'f') | Some(b'F') => {
                self.advance();
                NumberKind::Float32
            }
            Some(b'L') | Some(b'l') if !is_float => {
                self.advance();
                NumberKind::Int64
            }
            _ if is_float => NumberKind::Float64,
            _ => NumberKind::Int32,
        };
        self.push(TokenKind::Number(kind), start, line, column);
    }

    fn lex_ident(&mut self) {
        let (start, line, column) = (self.pos, self.line, self.column);
        while let Some(c) = self.src.get(self.pos).copied() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.src[start..self.pos];
        let kind = keyword_kind(text).unwrap_or(TokenKind::Ident);
        self.push(kind, start, line, column);
    }

    fn lex_operator(&mut self, diags: &mut Diagnostics) {
        let (start, line, column) = (self.pos, self.line, self.column);
        let c = self.src[self.pos];
        let two = self.peek(1);
        let (kind, len) = match (c, two) {
            (b'=', Some(b'=')) => (TokenKind::Eq, 2),
            (b'!', Some(b'=')) => (TokenKind::NotEq, 2),
            (b'<', Some(b'=')) => (TokenKind::LessEq, 2),
            (b'>', Some(b'=')) => (TokenKind::GreaterEq, 2),
            (b'&', Some(b'&')) => (TokenKind::AndAnd, 2),
            (b'|', Some(b'|')) => (TokenKind::OrOr, 2),
            (b'=', _) => (TokenKind::Assign, 1),
            (b'!', _) => (TokenKind::Not, 1),
            (b'<', _) => (TokenKind::Less, 1),
            (b'>', _) => (TokenKind::Greater, 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'{', _) => (TokenKind::LBrace, 1),
            (b'}', _) => (TokenKind::RBrace, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b';', _) => (TokenKind::Semicolon, 1),
            (b':', _) => (TokenKind::Colon, 1),
            (b'.', _) => (TokenKind::Dot, 1),
            (b'+', _) => (TokenKind::Plus, 1),
            (b'-', _) => (TokenKind::Minus, 1),
            (b'*', _) => (TokenKind::Star, 1),
            (b'/', _) => (TokenKind::Slash, 1),
            (b'%', _) => (TokenKind::Percent, 1),
            _ => {
                diags.error(line, column, format!("invalid character '{}'", c as char));
                self.skip_to_whitespace();
                return;
            }
        };
        for _ in 0..len {
            self.advance();
        }
        self.push(kind, start, line, column);
    }
}

fn keyword_kind(text: &[u8]) -> Option<TokenKind> {
    Some(match text {
        b"class" => TokenKind::Class,
        b"extends" => TokenKind::Extends,
        b"static" => TokenKind::Static,
        b"func" => TokenKind::Func,
        b"return" => TokenKind::Return,
        b"if" => TokenKind::If,
        b"else" => TokenKind::Else,
        b"while" => TokenKind::While,
        b"for" => TokenKind::For,
        b"true" => TokenKind::True,
        b"false" => TokenKind::False,
        b"null" => TokenKind::Null,
        b"int32" => TokenKind::TyInt32,
        b"int64" => TokenKind::TyInt64,
        b"float32" => TokenKind::TyFloat32,
        b"float64" => TokenKind::TyFloat64,
        b"bool" => TokenKind::TyBool,
        b"string" => TokenKind::TyString,
        b"cptr" => TokenKind::TyCPtr,
        b"iptr" => TokenKind::TyIPtr,
        b"fptr" => TokenKind::TyFPtr,
        b"bptr" => TokenKind::TyBPtr,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut diags = Diagnostics::new();
        let tokens = tokenize(src, &mut diags);
        assert!(!diags.has_errors(), "unexpected diagnostics");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            kinds("class Foo extends Bar"),
            vec![
                TokenKind::Class,
                TokenKind::Ident,
                TokenKind::Extends,
                TokenKind::Ident,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn numeric_suffixes() {
        let mut diags = Diagnostics::new();
        let tokens = tokenize("1 2L 1.5 1.5f 2f", &mut diags);
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Number(NumberKind::Int32),
                TokenKind::Number(NumberKind::Int64),
                TokenKind::Number(NumberKind::Float64),
                TokenKind::Number(NumberKind::Float32),
                TokenKind::Number(NumberKind::Float32),
                TokenKind::Eof,
            ]
        );
        assert_eq!(tokens[1].lexeme, "2L");
        assert_eq!(tokens[3].lexeme, "1.5f");
    }

    #[test]
    fn string_escapes() {
        let mut diags = Diagnostics::new();
        let tokens = tokenize(r#""a\tb\n""#, &mut diags);
        assert_eq!(tokens[0].string_value, "a\tb\n");
        assert!(!diags.has_errors());
    }

    #[test]
    fn unterminated_string_recovers() {
        let mut diags = Diagnostics::new();
        let tokens = tokenize("\"oops\nclass", &mut diags);
        assert!(diags.has_errors());
        // Lexing continued past the bad literal.
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Class));
    }

    #[test]
    fn invalid_character_recovers() {
        let mut diags = Diagnostics::new();
        let tokens = tokenize("@@@ func", &mut diags);
        assert!(diags.has_errors());
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Func));
    }

    #[test]
    fn block_comments_do_not_nest() {
        let mut diags = Diagnostics::new();
        let tokens = tokenize("/* a /* b */ class", &mut diags);
        assert!(!diags.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Class);
    }

    #[test]
    fn positions_are_one_based() {
        let mut diags = Diagnostics::new();
        let tokens = tokenize("a\n  b", &mut diags);
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn source_reconstruction_from_offsets() {
        // Re-concatenating lexemes with the original whitespace between them
        // reproduces a comment-free source exactly.
        let src = "class Foo {\n  int32 x = 1;\n  func go(): float32 {\n    return 1.5f;\n  }\n}\n";
        let mut diags = Diagnostics::new();
        let tokens = tokenize(src, &mut diags);
        assert!(!diags.has_errors());

        let mut rebuilt = String::new();
        let mut cursor = 0usize;
        for token in tokens.iter().filter(|t| t.kind != TokenKind::Eof) {
            rebuilt.push_str(&src[cursor..token.offset]);
            rebuilt.push_str(&token.lexeme);
            cursor = token.offset + token.lexeme.len();
        }
        rebuilt.push_str(&src[cursor..]);
        assert_eq!(rebuilt, src);
    }
}
