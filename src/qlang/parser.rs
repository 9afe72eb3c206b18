//! Recursive-descent parser with Pratt-style expression precedence.
//!
//! On a syntax error at a statement boundary the parser records a diagnostic
//! and resynchronizes at the next `;` or `}` so one mistake does not cascade
//! through the rest of the file.

use super::{
    ast::{
        BinaryOp, Block, ClassDecl, Expr, Literal, MemberDecl, MethodDecl, Param, Program, Stmt,
        TypeName, UnaryOp,
    },
    diag::Diagnostics,
    token::{NumberKind, Span, Token, TokenKind},
};

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    diags: &'a mut Diagnostics,
}

/// Parse a token stream into a program. Diagnostics accumulate; the returned
/// tree contains every declaration that parsed cleanly.
pub fn parse(tokens: &[Token], diags: &mut Diagnostics) -> Program {
    Parser {
        tokens,
        pos: 0,
        diags,
    }
    .program()
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_ahead(&self, n: usize) -> TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn bump(&mut self) -> &Token {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Option<Token> {
        if self.at(kind) {
            Some(self.bump().clone())
        } else {
            let token = self.peek().clone();
            self.diags.error(
                token.line,
                token.column,
                format!("expected {what}, found '{}'", describe(&token)),
            );
            None
        }
    }

    /// Skip forward to the next statement boundary.
    fn resync(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::Semicolon => {
                    self.bump();
                    return;
                }
                TokenKind::RBrace => return,
                _ => {
                    self.bump();
                }
            }
        }
    }

    // ---------------------------------------------------------------- decls

    fn program(&mut self) -> Program {
        let mut classes = Vec::new();
        while !self.at(TokenKind::Eof) {
            let is_static = self.eat(TokenKind::Static);
            if self.at(TokenKind::Class) {
                if let Some(class) = self.class_decl(is_static) {
                    classes.push(class);
                }
            } else {
                let token = self.peek().clone();
                self.diags.error(
                    token.line,
                    token.column,
                    format!("expected class declaration, found '{}'", describe(&token)),
                );
                self.resync();
                self.eat(TokenKind::RBrace);
            }
        }
        Program { classes }
    }

    fn class_decl(&mut self, is_static: bool) -> Option<ClassDecl> {
        let class_token = self.bump().clone(); // 'class'
        let name = self.expect(TokenKind::Ident, "class name")?;
        let parent_name = if self.eat(TokenKind::Extends) {
            Some(self.expect(TokenKind::Ident, "parent class name")?.lexeme)
        } else {
            None
        };
        self.expect(TokenKind::LBrace, "'{'")?;

        let mut members = Vec::new();
        let mut methods = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            if self.at(TokenKind::Func) {
                if let Some(method) = self.method_decl() {
                    methods.push(method);
                } else {
                    self.resync();
                }
            } else if let Some(member) = self.member_decl() {
                members.push(member);
            } else {
                self.resync();
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;

        Some(ClassDecl {
            name: name.lexeme,
            parent_name,
            members,
            methods,
            is_static,
            span: Span::of(&class_token),
        })
    }

    fn type_name(&mut self) -> Option<TypeName> {
        let token = self.peek().clone();
        if token.kind.is_type_name() || token.kind == TokenKind::Ident {
            self.bump();
            Some(TypeName {
                name: token.lexeme.clone(),
                span: Span::of(&token),
            })
        } else {
            self.diags.error(
                token.line,
                token.column,
                format!("expected type name, found '{}'", describe(&token)),
            );
            None
        }
    }

    fn member_decl(&mut self) -> Option<MemberDecl> {
        let ty = self.type_name()?;
        let name = self.expect(TokenKind::Ident, "member name")?;
        let init = if self.eat(TokenKind::Assign) {
            Some(self.expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        let span = ty.span;
        Some(MemberDecl {
            name: name.lexeme,
            ty,
            init,
            span,
        })
    }

    fn method_decl(&mut self) -> Option<MethodDecl> {
        let func_token = self.bump().clone(); // 'func'
        let name = self.expect(TokenKind::Ident, "method name")?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                let ty = self.type_name()?;
                let pname = self.expect(TokenKind::Ident, "parameter name")?;
                let span = ty.span;
                params.push(Param {
                    name: pname.lexeme,
                    ty,
                    span,
                });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let return_type = if self.eat(TokenKind::Colon) {
            Some(self.type_name()?)
        } else {
            None
        };
        let body = self.block()?;
        Some(MethodDecl {
            name: name.lexeme,
            params,
            return_type,
            body,
            span: Span::of(&func_token),
        })
    }

    // ---------------------------------------------------------------- stmts

    fn block(&mut self) -> Option<Block> {
        let open = self.expect(TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            match self.stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.resync(),
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Some(Block {
            stmts,
            span: Span::of(&open),
        })
    }

    fn stmt(&mut self) -> Option<Stmt> {
        let token = self.peek().clone();
        let span = Span::of(&token);
        match token.kind {
            TokenKind::LBrace => self.block().map(Stmt::Block),
            TokenKind::If => self.if_stmt(span),
            TokenKind::While => self.while_stmt(span),
            TokenKind::For => self.for_stmt(span),
            TokenKind::Return => {
                self.bump();
                let value = if self.at(TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(TokenKind::Semicolon, "';'")?;
                Some(Stmt::Return { value, span })
            }
            _ => {
                let stmt = self.simple_stmt()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Some(stmt)
            }
        }
    }

    /// A statement without its trailing `;`: var-decl, assignment or a bare
    /// expression. Shared with `for` headers.
    fn simple_stmt(&mut self) -> Option<Stmt> {
        let token = self.peek().clone();
        let span = Span::of(&token);

        // Type name followed by an identifier begins a var-decl. An
        // identifier can also begin a cast or call, so look one ahead.
        let is_decl = token.kind.is_type_name() && self.peek_ahead(1) == TokenKind::Ident
            || token.kind == TokenKind::Ident && self.peek_ahead(1) == TokenKind::Ident;
        if is_decl {
            let ty = self.type_name()?;
            let name = self.expect(TokenKind::Ident, "variable name")?;
            let init = if self.eat(TokenKind::Assign) {
                Some(self.expr()?)
            } else {
                None
            };
            return Some(Stmt::VarDecl {
                name: name.lexeme,
                ty,
                init,
                span,
            });
        }

        let expr = self.expr()?;
        if self.eat(TokenKind::Assign) {
            let value = self.expr()?;
            match expr {
                Expr::Ident { .. } | Expr::Member { .. } => Some(Stmt::Assign {
                    target: expr,
                    value,
                    span,
                }),
                _ => {
                    self.diags
                        .error(span.line, span.column, "invalid assignment target");
                    None
                }
            }
        } else {
            Some(Stmt::Expr { expr, span })
        }
    }

    fn if_stmt(&mut self, span: Span) -> Option<Stmt> {
        self.bump(); // 'if'
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let then_block = self.block()?;
        let else_block = if self.eat(TokenKind::Else) {
            if self.at(TokenKind::If) {
                // else-if chains nest as a single-statement block
                let nested_span = Span::of(self.peek());
                let nested = self.if_stmt(nested_span)?;
                Some(Block {
                    stmts: vec![nested],
                    span: nested_span,
                })
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Some(Stmt::If {
            cond,
            then_block,
            else_block,
            span,
        })
    }

    fn while_stmt(&mut self, span: Span) -> Option<Stmt> {
        self.bump(); // 'while'
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.block()?;
        Some(Stmt::While { cond, body, span })
    }

    fn for_stmt(&mut self, span: Span) -> Option<Stmt> {
        self.bump(); // 'for'
        self.expect(TokenKind::LParen, "'('")?;
        let init = if self.at(TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.simple_stmt()?))
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        let cond = if self.at(TokenKind::Semicolon) {
            None
        } else {
            Some(self.expr()?)
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        let step = if self.at(TokenKind::RParen) {
            None
        } else {
            Some(Box::new(self.simple_stmt()?))
        };
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.block()?;
        Some(Stmt::For {
            init,
            cond,
            step,
            body,
            span,
        })
    }

    // ---------------------------------------------------------------- exprs

    fn expr(&mut self) -> Option<Expr> {
        self.binary_expr(0)
    }

    fn binary_expr(&mut self, min_prec: u8) -> Option<Expr> {
        let mut lhs = self.unary_expr()?;
        loop {
            let Some((op, prec)) = binary_op(self.peek_kind()) else {
                return Some(lhs);
            };
            if prec < min_prec {
                return Some(lhs);
            }
            let op_token = self.bump().clone();
            let rhs = self.binary_expr(prec + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span: Span::of(&op_token),
            };
        }
    }

    fn unary_expr(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        let op = match token.kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Not => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.unary_expr()?;
            return Some(Expr::Unary {
                op,
                operand: Box::new(operand),
                span: Span::of(&token),
            });
        }
        self.postfix_expr()
    }

    fn postfix_expr(&mut self) -> Option<Expr> {
        let mut expr = self.primary_expr()?;
        loop {
            if self.at(TokenKind::Dot) {
                self.bump();
                let member = self.expect(TokenKind::Ident, "member name")?;
                let span = Span::of(&member);
                if self.at(TokenKind::LParen) {
                    let args = self.call_args()?;
                    expr = Expr::Call {
                        base: Some(Box::new(expr)),
                        name: member.lexeme,
                        args,
                        span,
                    };
                } else {
                    expr = Expr::Member {
                        base: Box::new(expr),
                        member: member.lexeme,
                        span,
                    };
                }
            } else {
                return Some(expr);
            }
        }
    }

    fn call_args(&mut self) -> Option<Vec<Expr>> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                args.push(self.expr()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Some(args)
    }

    fn primary_expr(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        let span = Span::of(&token);
        match token.kind {
            TokenKind::Number(kind) => {
                self.bump();
                let value = number_literal(&token, kind, self.diags)?;
                Some(Expr::Literal { value, span })
            }
            TokenKind::Str => {
                self.bump();
                Some(Expr::Literal {
                    value: Literal::Str(token.string_value.clone()),
                    span,
                })
            }
            TokenKind::True => {
                self.bump();
                Some(Expr::Literal {
                    value: Literal::Bool(true),
                    span,
                })
            }
            TokenKind::False => {
                self.bump();
                Some(Expr::Literal {
                    value: Literal::Bool(false),
                    span,
                })
            }
            TokenKind::Null => {
                self.bump();
                Some(Expr::Literal {
                    value: Literal::Null,
                    span,
                })
            }
            kind if kind.is_type_name() => {
                // Primitive type name in call position is an explicit cast.
                self.bump();
                self.expect(TokenKind::LParen, "'(' after cast type")?;
                let operand = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Some(Expr::Cast {
                    ty: TypeName {
                        name: token.lexeme.clone(),
                        span,
                    },
                    operand: Box::new(operand),
                    span,
                })
            }
            TokenKind::Ident => {
                self.bump();
                if self.at(TokenKind::LParen) {
                    let args = self.call_args()?;
                    Some(Expr::Call {
                        base: None,
                        name: token.lexeme.clone(),
                        args,
                        span,
                    })
                } else {
                    Some(Expr::Ident {
                        name: token.lexeme.clone(),
                        span,
                    })
                }
            }
            TokenKind::LParen => {
                self.bump();
                let inner = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Some(inner)
            }
            _ => {
                self.diags.error(
                    token.line,
                    token.column,
                    format!("expected expression, found '{}'", describe(&token)),
                );
                None
            }
        }
    }
}

fn binary_op(kind: TokenKind) -> Option<(BinaryOp, u8)> {
    Some(match kind {
        TokenKind::OrOr => (BinaryOp::Or, 1),
        TokenKind::AndAnd => (BinaryOp::And, 2),
        TokenKind::Eq => (BinaryOp::Eq, 3),
        TokenKind::NotEq => (BinaryOp::NotEq, 3),
        TokenKind::Less => (BinaryOp::Less, 4),
        TokenKind::LessEq => (BinaryOp::LessEq, 4),
        TokenKind::Greater => (BinaryOp::Greater, 4),
        TokenKind::GreaterEq => (BinaryOp::GreaterEq, 4),
        TokenKind::Plus => (BinaryOp::Add, 5),
        TokenKind::Minus => (BinaryOp::Sub, 5),
        TokenKind::Star => (BinaryOp::Mul, 6),
        TokenKind::Slash => (BinaryOp::Div, 6),
        TokenKind::Percent => (BinaryOp::Rem, 6),
        _ => return None,
    })
}

fn number_literal(token: &Token, kind: NumberKind, diags: &mut Diagnostics) -> Option<Literal> {
    let digits = token
        .lexeme
        .trim_end_matches(['f', 'F', 'l', 'L']);
    let parsed = match kind {
        NumberKind::Int32 => digits.parse::<i32>().map(Literal::Int32).ok(),
        NumberKind::Int64 => digits.parse::<i64>().map(Literal::Int64).ok(),
        NumberKind::Float32 => digits.parse::<f32>().map(Literal::Float32).ok(),
        NumberKind::Float64 => digits.parse::<f64>().map(Literal::Float64).ok(),
    };
    if parsed.is_none() {
        diags.error(
            token.line,
            token.column,
            format!("numeric literal '{}' out of range", token.lexeme),
        );
    }
    parsed
}

fn describe(token: &Token) -> String {
    if token.kind == TokenKind::Eof {
        "end of file".to_owned()
    } else {
        token.lexeme.clone()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::qlang::lexer::tokenize,
    };

    fn parse_ok(src: &str) -> Program {
        let mut diags = Diagnostics::new();
        let tokens = tokenize(src, &mut diags);
        let program = parse(&tokens, &mut diags);
        assert!(!diags.has_errors(), "unexpected parse errors");
        program
    }

    #[test]
    fn class_with_members_and_method() {
        let program = parse_ok(
            "class Foo extends Bar {\n\
             \tfloat32 x = 1.5f;\n\
             \tint32 count;\n\
             \tfunc tick(float32 dt): int32 {\n\
             \t\treturn count;\n\
             \t}\n\
             }",
        );
        assert_eq!(program.classes.len(), 1);
        let class = &program.classes[0];
        assert_eq!(class.name, "Foo");
        assert_eq!(class.parent_name.as_deref(), Some("Bar"));
        assert_eq!(class.members.len(), 2);
        assert!(class.members[0].init.is_some());
        assert_eq!(class.methods.len(), 1);
        assert_eq!(class.methods[0].params.len(), 1);
        assert_eq!(
            class.methods[0].return_type.as_ref().map(|t| t.name.as_str()),
            Some("int32")
        );
    }

    #[test]
    fn static_class_flag() {
        let program = parse_ok("static class Globals { int32 frames; }");
        assert!(program.classes[0].is_static);
    }

    #[test]
    fn precedence_and_grouping() {
        let program = parse_ok(
            "class T { func f(): int32 { return 1 + 2 * 3; } }",
        );
        let Stmt::Return { value: Some(expr), .. } = &program.classes[0].methods[0].body.stmts[0]
        else {
            panic!("expected return");
        };
        let Expr::Binary { op: BinaryOp::Add, rhs, .. } = expr else {
            panic!("expected + at the root");
        };
        assert!(matches!(**rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn cast_expression() {
        let program = parse_ok("class T { func f(float64 v): int32 { return int32(v); } }");
        let Stmt::Return { value: Some(expr), .. } = &program.classes[0].methods[0].body.stmts[0]
        else {
            panic!()
        };
        assert!(matches!(expr, Expr::Cast { ty, .. } if ty.name == "int32"));
    }

    #[test]
    fn control_flow_statements() {
        parse_ok(
            "class T { func f() {\n\
             \tint32 i = 0;\n\
             \tfor (i = 0; i < 10; i = i + 1) { printf(i); }\n\
             \twhile (i > 0) { i = i - 1; }\n\
             \tif (i == 0) { printf(\"done\"); } else { printf(\"odd\"); }\n\
             } }",
        );
    }

    #[test]
    fn error_recovery_resyncs_at_statement_boundary() {
        let mut diags = Diagnostics::new();
        let tokens = tokenize(
            "class T { func f() { int32 x = ; x = 1; } func g() { } }",
            &mut diags,
        );
        let program = parse(&tokens, &mut diags);
        assert!(diags.has_errors());
        // The second method survived the first one's bad statement.
        assert_eq!(program.classes[0].methods.len(), 2);
    }

    #[test]
    fn member_chain_calls() {
        let program = parse_ok("class T { func f(Other o) { o.child.poke(1, 2); } }");
        let Stmt::Expr { expr, .. } = &program.classes[0].methods[0].body.stmts[0] else {
            panic!()
        };
        let Expr::Call { base: Some(base), name, args, .. } = expr else {
            panic!("expected call")
        };
        assert_eq!(name, "poke");
        assert_eq!(args.len(), 2);
        assert!(matches!(**base, Expr::Member { .. }));
    }
}
