// ABOUTME: Parser building the template AST from tokens, with constant folding

use crate::ast::*;
use crate::error::ParseError;
use crate::eval;
use crate::lexer;
use crate::token::{Span, Token};
use crate::value::Value;
use crate::Options;
use std::sync::Arc;

/// Parse template source into an immutable `Program`.
pub fn parse(source: &str, options: &Options) -> Result<Program, ParseError> {
    let tokens = lexer::tokenize(source, options)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        loop_depth: 0,
    };
    let (body, _) = parser.parse_nodes(&[])?;
    Ok(Program {
        body: fold_stmts(body),
    })
}

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    /// lexical `for` nesting, for validating `break`/`continue`
    loop_depth: usize,
}

fn describe_terminators(terminators: &[&str]) -> String {
    if terminators.is_empty() {
        "end of template".to_string()
    } else {
        terminators
            .iter()
            .map(|t| format!("'{}'", t))
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek2(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, s)| *s)
            .unwrap_or_default()
    }

    fn next(&mut self) -> Option<(Token, Span)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.tokens.get(self.pos) {
            Some((token, span)) => ParseError::UnexpectedToken {
                found: token.describe(),
                expected: expected.to_string(),
                offset: span.start as usize,
            },
            None => ParseError::UnexpectedEof {
                expected: expected.to_string(),
            },
        }
    }

    fn expect(&mut self, token: &Token, expected: &str) -> Result<Span, ParseError> {
        match self.tokens.get(self.pos) {
            Some((found, span)) if found == token => {
                let span = *span;
                self.pos += 1;
                Ok(span)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<(String, Span), ParseError> {
        match self.tokens.get(self.pos) {
            Some((Token::Ident(name), span)) => {
                let out = (name.clone(), *span);
                self.pos += 1;
                Ok(out)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Parse nodes until one of `terminators` opens a `{% ... %}` tag (the
    /// terminator keyword is consumed, the rest of its tag is left for the
    /// caller) or, with no terminators, until end of input.
    fn parse_nodes(
        &mut self,
        terminators: &[&str],
    ) -> Result<(Vec<Stmt>, Option<String>), ParseError> {
        let mut body = Vec::new();
        loop {
            match self.next() {
                None => {
                    if terminators.is_empty() {
                        return Ok((body, None));
                    }
                    return Err(ParseError::UnexpectedEof {
                        expected: describe_terminators(terminators),
                    });
                }
                Some((Token::TemplateData(text), _)) => body.push(Stmt::Text(text)),
                Some((Token::VariableStart, _)) => {
                    let expr = self.parse_expr()?;
                    self.expect(&Token::VariableEnd, "'}}'")?;
                    body.push(Stmt::Emit(expr));
                }
                Some((Token::BlockStart, block_span)) => {
                    let (name, name_span) = self.expect_ident("a statement keyword")?;
                    if terminators.contains(&name.as_str()) {
                        return Ok((body, Some(name)));
                    }
                    if name.starts_with("end") || name == "else" || name == "elif" {
                        return Err(ParseError::MismatchedEndTag {
                            expected: describe_terminators(terminators),
                            found: name,
                            offset: name_span.start as usize,
                        });
                    }
                    body.push(self.parse_stmt(&name, block_span, name_span)?);
                }
                Some((token, span)) => {
                    return Err(ParseError::UnexpectedToken {
                        found: token.describe(),
                        expected: "template text or a tag".to_string(),
                        offset: span.start as usize,
                    });
                }
            }
        }
    }

    fn parse_stmt(
        &mut self,
        keyword: &str,
        span: Span,
        keyword_span: Span,
    ) -> Result<Stmt, ParseError> {
        match keyword {
            "if" => self.parse_if(span),
            "for" => self.parse_for(span),
            "set" => self.parse_set(span),
            "macro" => self.parse_macro(span),
            "filter" => self.parse_filter_block(span),
            "call" => self.parse_call_block(span),
            "break" => {
                if self.loop_depth == 0 {
                    return Err(ParseError::OrphanedLoopControl {
                        keyword: "break",
                        offset: keyword_span.start as usize,
                    });
                }
                self.expect(&Token::BlockEnd, "'%}'")?;
                Ok(Stmt::Break(span))
            }
            "continue" => {
                if self.loop_depth == 0 {
                    return Err(ParseError::OrphanedLoopControl {
                        keyword: "continue",
                        offset: keyword_span.start as usize,
                    });
                }
                self.expect(&Token::BlockEnd, "'%}'")?;
                Ok(Stmt::Continue(span))
            }
            other => Err(ParseError::UnexpectedToken {
                found: format!("'{}'", other),
                expected: "a statement keyword".to_string(),
                offset: keyword_span.start as usize,
            }),
        }
    }

    fn parse_if(&mut self, span: Span) -> Result<Stmt, ParseError> {
        let cond = self.parse_expr()?;
        self.expect(&Token::BlockEnd, "'%}'")?;
        let (then_body, terminator) = self.parse_nodes(&["elif", "else", "endif"])?;
        let else_body = match terminator.as_deref() {
            Some("elif") => {
                let elif_span = self.peek_span();
                vec![self.parse_if(elif_span)?]
            }
            Some("else") => {
                self.expect(&Token::BlockEnd, "'%}'")?;
                let (body, _) = self.parse_nodes(&["endif"])?;
                self.expect(&Token::BlockEnd, "'%}'")?;
                body
            }
            _ => {
                self.expect(&Token::BlockEnd, "'%}'")?;
                Vec::new()
            }
        };
        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
            span,
        })
    }

    fn parse_for(&mut self, span: Span) -> Result<Stmt, ParseError> {
        let target = self.parse_target()?;
        let (keyword, kw_span) = self.expect_ident("'in'")?;
        if keyword != "in" {
            return Err(ParseError::UnexpectedToken {
                found: format!("'{}'", keyword),
                expected: "'in'".to_string(),
                offset: kw_span.start as usize,
            });
        }
        // no ternary at this level, so a trailing `if` reads as the loop filter
        let iterable = self.parse_or()?;
        let filter = if self.eat_keyword("if") {
            Some(self.parse_or()?)
        } else {
            None
        };
        self.expect(&Token::BlockEnd, "'%}'")?;
        self.loop_depth += 1;
        let result = self.parse_nodes(&["else", "endfor"]);
        self.loop_depth -= 1;
        let (body, terminator) = result?;
        let else_body = if terminator.as_deref() == Some("else") {
            self.expect(&Token::BlockEnd, "'%}'")?;
            let (body, _) = self.parse_nodes(&["endfor"])?;
            self.expect(&Token::BlockEnd, "'%}'")?;
            body
        } else {
            self.expect(&Token::BlockEnd, "'%}'")?;
            Vec::new()
        };
        Ok(Stmt::For {
            target,
            iterable,
            filter,
            body,
            else_body,
            span,
        })
    }

    fn parse_target(&mut self) -> Result<LoopTarget, ParseError> {
        let (first, _) = self.expect_ident("a loop variable name")?;
        let mut names = vec![first];
        while self.eat(&Token::Comma) {
            if !matches!(self.peek(), Some(Token::Ident(_))) {
                break;
            }
            names.push(self.expect_ident("a loop variable name")?.0);
        }
        if names.len() == 1 {
            Ok(LoopTarget::Name(names.remove(0)))
        } else {
            Ok(LoopTarget::Tuple(names))
        }
    }

    fn parse_set(&mut self, span: Span) -> Result<Stmt, ParseError> {
        let (name, _) = self.expect_ident("a variable name")?;
        match self.peek() {
            Some(Token::BlockEnd) => {
                self.next();
                let (body, _) = self.parse_nodes(&["endset"])?;
                self.expect(&Token::BlockEnd, "'%}'")?;
                Ok(Stmt::SetBlock { name, body, span })
            }
            Some(Token::Dot) => {
                let mut path = Vec::new();
                while self.eat(&Token::Dot) {
                    path.push(self.expect_ident("an attribute name")?.0);
                }
                self.expect(&Token::Assign, "'='")?;
                let value = self.parse_expr()?;
                self.expect(&Token::BlockEnd, "'%}'")?;
                Ok(Stmt::SetAttr {
                    name,
                    path,
                    value,
                    span,
                })
            }
            Some(Token::Comma) => {
                let mut names = vec![name];
                while self.eat(&Token::Comma) {
                    names.push(self.expect_ident("a variable name")?.0);
                }
                self.expect(&Token::Assign, "'='")?;
                let value = self.parse_expr()?;
                self.expect(&Token::BlockEnd, "'%}'")?;
                Ok(Stmt::Set {
                    target: LoopTarget::Tuple(names),
                    value,
                    span,
                })
            }
            Some(Token::Assign) => {
                self.next();
                let value = self.parse_expr()?;
                self.expect(&Token::BlockEnd, "'%}'")?;
                Ok(Stmt::Set {
                    target: LoopTarget::Name(name),
                    value,
                    span,
                })
            }
            _ => Err(self.unexpected("'=', '.', ',' or '%}'")),
        }
    }

    fn parse_macro(&mut self, span: Span) -> Result<Stmt, ParseError> {
        let (name, _) = self.expect_ident("a macro name")?;
        self.expect(&Token::ParenOpen, "'('")?;
        let mut params = Vec::new();
        while !self.at(&Token::ParenClose) {
            let (param_name, _) = self.expect_ident("a parameter name")?;
            let default = if self.eat(&Token::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param {
                name: param_name,
                default,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::ParenClose, "')'")?;
        self.expect(&Token::BlockEnd, "'%}'")?;
        // a macro body is a fresh invocation context; loop controls inside it
        // cannot target a lexically enclosing for
        let saved_depth = std::mem::replace(&mut self.loop_depth, 0);
        let result = self.parse_nodes(&["endmacro"]);
        self.loop_depth = saved_depth;
        let (body, _) = result?;
        self.expect(&Token::BlockEnd, "'%}'")?;
        Ok(Stmt::Macro(Arc::new(MacroDecl {
            name,
            params,
            body,
            span,
        })))
    }

    fn parse_filter_block(&mut self, span: Span) -> Result<Stmt, ParseError> {
        let mut filters = Vec::new();
        loop {
            let (name, name_span) = self.expect_ident("a filter name")?;
            let args = if self.at(&Token::ParenOpen) {
                self.parse_call_args()?
            } else {
                Vec::new()
            };
            filters.push(FilterSpec {
                name,
                args,
                span: name_span,
            });
            if !self.eat(&Token::Pipe) {
                break;
            }
        }
        self.expect(&Token::BlockEnd, "'%}'")?;
        let (body, _) = self.parse_nodes(&["endfilter"])?;
        self.expect(&Token::BlockEnd, "'%}'")?;
        Ok(Stmt::FilterBlock {
            filters,
            body,
            span,
        })
    }

    fn parse_call_block(&mut self, span: Span) -> Result<Stmt, ParseError> {
        let call = self.parse_expr()?;
        if !matches!(call.kind, ExprKind::Call { .. }) {
            return Err(ParseError::UnexpectedToken {
                found: "expression".to_string(),
                expected: "a macro call".to_string(),
                offset: call.span.start as usize,
            });
        }
        self.expect(&Token::BlockEnd, "'%}'")?;
        let saved_depth = std::mem::replace(&mut self.loop_depth, 0);
        let result = self.parse_nodes(&["endcall"]);
        self.loop_depth = saved_depth;
        let (body, _) = result?;
        self.expect(&Token::BlockEnd, "'%}'")?;
        Ok(Stmt::CallBlock {
            call,
            body: Arc::new(body),
            span,
        })
    }

    // ========================================================================
    // Expressions, one function per precedence level (lowest first)
    // ========================================================================

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_or()?;
        if self.eat_keyword("if") {
            let cond = self.parse_or()?;
            let otherwise = if self.eat_keyword("else") {
                // right-associative on the alternate
                Some(Box::new(self.parse_expr()?))
            } else {
                None
            };
            let span = expr.span;
            return Ok(Expr::new(
                ExprKind::Ternary {
                    then: Box::new(expr),
                    cond: Box::new(cond),
                    otherwise,
                },
                span,
            ));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            expr = binary(BinaryOp::Or, expr, right);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            expr = binary(BinaryOp::And, expr, right);
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.at_keyword("not") {
            let span = self.peek_span();
            self.next();
            let operand = self.parse_not()?;
            let span = span.to(operand.span);
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_equality()
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                _ => break,
            };
            self.next();
            let right = self.parse_comparison()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_concat()?;
        loop {
            match self.peek() {
                Some(Token::Lt) => {
                    self.next();
                    expr = binary(BinaryOp::Lt, expr, self.parse_concat()?);
                }
                Some(Token::Lte) => {
                    self.next();
                    expr = binary(BinaryOp::Le, expr, self.parse_concat()?);
                }
                Some(Token::Gt) => {
                    self.next();
                    expr = binary(BinaryOp::Gt, expr, self.parse_concat()?);
                }
                Some(Token::Gte) => {
                    self.next();
                    expr = binary(BinaryOp::Ge, expr, self.parse_concat()?);
                }
                Some(Token::Ident(name)) if name == "in" => {
                    self.next();
                    expr = binary(BinaryOp::In, expr, self.parse_concat()?);
                }
                Some(Token::Ident(name))
                    if name == "not" && matches!(self.peek2(), Some(Token::Ident(n)) if n == "in") =>
                {
                    self.next();
                    self.next();
                    expr = binary(BinaryOp::NotIn, expr, self.parse_concat()?);
                }
                Some(Token::Ident(name)) if name == "is" => {
                    self.next();
                    expr = self.parse_test(expr)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// `value is [not] name`, with arguments either parenthesized or as a
    /// single bare operand (`x is divisibleby 3`).
    fn parse_test(&mut self, value: Expr) -> Result<Expr, ParseError> {
        let negated = self.eat_keyword("not");
        let (name, name_span) = self.expect_ident("a test name")?;
        let args = if self.at(&Token::ParenOpen) {
            self.parse_call_args()?
        } else if self.at_test_argument() {
            vec![Arg::Pos(self.parse_concat()?)]
        } else {
            Vec::new()
        };
        let span = value.span.to(name_span);
        Ok(Expr::new(
            ExprKind::Test {
                value: Box::new(value),
                name,
                args,
                negated,
            },
            span,
        ))
    }

    fn at_test_argument(&self) -> bool {
        match self.peek() {
            Some(
                Token::Int(_)
                | Token::Float(_)
                | Token::Str(_)
                | Token::Bool(_)
                | Token::None
                | Token::BracketOpen
                | Token::BraceOpen,
            ) => true,
            Some(Token::Ident(name)) => {
                !matches!(name.as_str(), "and" | "or" | "not" | "if" | "else" | "in" | "is")
            }
            _ => false,
        }
    }

    fn parse_concat(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_additive()?;
        while self.eat(&Token::Tilde) {
            let right = self.parse_additive()?;
            expr = binary(BinaryOp::Concat, expr, right);
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_multiplicative()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Mul) => BinaryOp::Mul,
                Some(Token::Div) => BinaryOp::Div,
                Some(Token::FloorDiv) => BinaryOp::FloorDiv,
                Some(Token::Mod) => BinaryOp::Rem,
                _ => break,
            };
            self.next();
            let right = self.parse_unary()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Plus) => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.peek_span();
            self.next();
            let operand = self.parse_unary()?;
            let span = span.to(operand.span);
            return Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_filtered()?;
        if self.eat(&Token::Pow) {
            // right-associative; routing through unary admits `2 ** -3`
            let exponent = self.parse_unary()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_filtered(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_postfix()?;
        while self.eat(&Token::Pipe) {
            let (name, name_span) = self.expect_ident("a filter name")?;
            let args = if self.at(&Token::ParenOpen) {
                self.parse_call_args()?
            } else {
                Vec::new()
            };
            let span = expr.span.to(name_span);
            expr = Expr::new(
                ExprKind::Filter {
                    value: Box::new(expr),
                    name,
                    args,
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let (name, name_span) = self.expect_ident("an attribute name")?;
                let span = expr.span.to(name_span);
                expr = Expr::new(
                    ExprKind::Attr {
                        base: Box::new(expr),
                        name,
                    },
                    span,
                );
            } else if self.at(&Token::ParenOpen) {
                let args = self.parse_call_args()?;
                let span = expr.span;
                expr = Expr::new(
                    ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    span,
                );
            } else if self.eat(&Token::BracketOpen) {
                expr = self.parse_subscript(expr)?;
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// `base[key]` or `base[start:stop:step]` with any part omitted.
    fn parse_subscript(&mut self, base: Expr) -> Result<Expr, ParseError> {
        let start = if self.at(&Token::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        if !self.eat(&Token::Colon) {
            let close = self.expect(&Token::BracketClose, "']'")?;
            let key = start.ok_or_else(|| self.unexpected("an expression"))?;
            let span = base.span.to(close);
            return Ok(Expr::new(
                ExprKind::Index {
                    base: Box::new(base),
                    key,
                },
                span,
            ));
        }
        let stop = if self.at(&Token::Colon) || self.at(&Token::BracketClose) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let step = if self.eat(&Token::Colon) && !self.at(&Token::BracketClose) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        let close = self.expect(&Token::BracketClose, "']'")?;
        let span = base.span.to(close);
        Ok(Expr::new(
            ExprKind::Slice {
                base: Box::new(base),
                start,
                stop,
                step,
            },
            span,
        ))
    }

    fn parse_call_args(&mut self) -> Result<Vec<Arg>, ParseError> {
        self.expect(&Token::ParenOpen, "'('")?;
        let mut args = Vec::new();
        while !self.at(&Token::ParenClose) {
            if matches!(self.peek(), Some(Token::Ident(_)))
                && matches!(self.peek2(), Some(Token::Assign))
            {
                let (name, _) = self.expect_ident("an argument name")?;
                self.next(); // '='
                args.push(Arg::Kw(name, self.parse_expr()?));
            } else {
                args.push(Arg::Pos(self.parse_expr()?));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::ParenClose, "')'")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some((Token::Int(v), span)) => Ok(Expr::new(ExprKind::Literal(Literal::Int(v)), span)),
            Some((Token::Float(v), span)) => {
                Ok(Expr::new(ExprKind::Literal(Literal::Float(v)), span))
            }
            Some((Token::Str(s), span)) => Ok(Expr::new(ExprKind::Literal(Literal::Str(s)), span)),
            Some((Token::Bool(b), span)) => {
                Ok(Expr::new(ExprKind::Literal(Literal::Bool(b)), span))
            }
            Some((Token::None, span)) => Ok(Expr::new(ExprKind::Literal(Literal::Null), span)),
            Some((Token::Ident(name), span)) => Ok(Expr::new(ExprKind::Var(name), span)),
            Some((Token::ParenOpen, span)) => {
                let first = self.parse_expr()?;
                if self.at(&Token::Comma) {
                    // parenthesized tuple, e.g. `(a, b)`
                    let mut items = vec![first];
                    while self.eat(&Token::Comma) {
                        if self.at(&Token::ParenClose) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                    let close = self.expect(&Token::ParenClose, "')'")?;
                    return Ok(Expr::new(ExprKind::Array(items), span.to(close)));
                }
                self.expect(&Token::ParenClose, "')'")?;
                Ok(first)
            }
            Some((Token::BracketOpen, span)) => {
                let mut items = Vec::new();
                while !self.at(&Token::BracketClose) {
                    items.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                let close = self.expect(&Token::BracketClose, "']'")?;
                Ok(Expr::new(ExprKind::Array(items), span.to(close)))
            }
            Some((Token::BraceOpen, span)) => {
                let mut entries = Vec::new();
                while !self.at(&Token::BraceClose) {
                    let key = self.parse_expr()?;
                    self.expect(&Token::Colon, "':'")?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                let close = self.expect(&Token::BraceClose, "'}'")?;
                Ok(Expr::new(ExprKind::Map(entries), span.to(close)))
            }
            Some((token, span)) => Err(ParseError::UnexpectedToken {
                found: token.describe(),
                expected: "an expression".to_string(),
                offset: span.start as usize,
            }),
            None => Err(ParseError::UnexpectedEof {
                expected: "an expression".to_string(),
            }),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let span = left.span.to(right.span);
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

// ============================================================================
// Constant folding
// ============================================================================

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(v) => Value::Int(*v),
        Literal::Float(v) => Value::Float(*v),
        Literal::Str(s) => Value::String(s.clone()),
    }
}

fn value_literal(value: &Value) -> Option<Literal> {
    match value {
        Value::Null => Some(Literal::Null),
        Value::Bool(b) => Some(Literal::Bool(*b)),
        Value::Int(v) => Some(Literal::Int(*v)),
        Value::Float(v) => Some(Literal::Float(*v)),
        Value::String(s) => Some(Literal::Str(s.clone())),
        _ => None,
    }
}

fn as_literal(expr: &Expr) -> Option<&Literal> {
    match &expr.kind {
        ExprKind::Literal(literal) => Some(literal),
        _ => None,
    }
}

fn fold_stmts(stmts: Vec<Stmt>) -> Vec<Stmt> {
    let mut folded = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        fold_stmt_into(stmt, &mut folded);
    }
    // coalesce the text runs folding just created
    let mut out: Vec<Stmt> = Vec::with_capacity(folded.len());
    for stmt in folded {
        if let (Some(Stmt::Text(prev)), Stmt::Text(next)) = (out.last_mut(), &stmt) {
            prev.push_str(next);
            continue;
        }
        out.push(stmt);
    }
    out
}

fn fold_stmt_into(stmt: Stmt, out: &mut Vec<Stmt>) {
    match stmt {
        Stmt::Emit(expr) => {
            let expr = fold_expr(expr);
            // a fully folded emission is just text
            match as_literal(&expr) {
                Some(literal) => {
                    let text = literal_value(literal).render_string();
                    if !text.is_empty() {
                        out.push(Stmt::Text(text));
                    }
                }
                None => out.push(Stmt::Emit(expr)),
            }
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
            span,
        } => {
            let cond = fold_expr(cond);
            let then_body = fold_stmts(then_body);
            let else_body = fold_stmts(else_body);
            match as_literal(&cond) {
                Some(literal) => {
                    let branch = if literal_value(literal).is_truthy() {
                        then_body
                    } else {
                        else_body
                    };
                    out.extend(branch);
                }
                None => out.push(Stmt::If {
                    cond,
                    then_body,
                    else_body,
                    span,
                }),
            }
        }
        Stmt::For {
            target,
            iterable,
            filter,
            body,
            else_body,
            span,
        } => out.push(Stmt::For {
            target,
            iterable: fold_expr(iterable),
            filter: filter.map(fold_expr),
            body: fold_stmts(body),
            else_body: fold_stmts(else_body),
            span,
        }),
        Stmt::Set {
            target,
            value,
            span,
        } => out.push(Stmt::Set {
            target,
            value: fold_expr(value),
            span,
        }),
        Stmt::SetAttr {
            name,
            path,
            value,
            span,
        } => out.push(Stmt::SetAttr {
            name,
            path,
            value: fold_expr(value),
            span,
        }),
        Stmt::SetBlock { name, body, span } => out.push(Stmt::SetBlock {
            name,
            body: fold_stmts(body),
            span,
        }),
        Stmt::Macro(decl) => {
            let decl = MacroDecl {
                name: decl.name.clone(),
                params: decl
                    .params
                    .iter()
                    .map(|p| Param {
                        name: p.name.clone(),
                        default: p.default.clone().map(fold_expr),
                    })
                    .collect(),
                body: fold_stmts(decl.body.clone()),
                span: decl.span,
            };
            out.push(Stmt::Macro(Arc::new(decl)));
        }
        Stmt::FilterBlock {
            filters,
            body,
            span,
        } => out.push(Stmt::FilterBlock {
            filters: filters
                .into_iter()
                .map(|spec| FilterSpec {
                    name: spec.name,
                    args: spec.args.into_iter().map(fold_arg).collect(),
                    span: spec.span,
                })
                .collect(),
            body: fold_stmts(body),
            span,
        }),
        Stmt::CallBlock { call, body, span } => out.push(Stmt::CallBlock {
            call: fold_expr(call),
            body: Arc::new(fold_stmts(body.as_ref().clone())),
            span,
        }),
        other @ (Stmt::Text(_) | Stmt::Break(_) | Stmt::Continue(_)) => out.push(other),
    }
}

fn fold_arg(arg: Arg) -> Arg {
    match arg {
        Arg::Pos(expr) => Arg::Pos(fold_expr(expr)),
        Arg::Kw(name, expr) => Arg::Kw(name, fold_expr(expr)),
    }
}

/// Fold literal-only subtrees down to literals. Subtrees whose evaluation
/// would fail (division by zero and friends) are left intact so the error
/// surfaces at render time.
fn fold_expr(expr: Expr) -> Expr {
    let span = expr.span;
    match expr.kind {
        ExprKind::Unary { op, operand } => {
            let operand = fold_expr(*operand);
            if let Some(literal) = as_literal(&operand) {
                let value = literal_value(literal);
                let folded = match op {
                    UnaryOp::Not => Some(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => value.neg().ok(),
                    UnaryOp::Pos => value.is_number().then_some(value),
                };
                if let Some(literal) = folded.as_ref().and_then(value_literal) {
                    return Expr::new(ExprKind::Literal(literal), span);
                }
            }
            Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            )
        }
        ExprKind::Binary { op, left, right } => {
            let left = fold_expr(*left);
            let right = fold_expr(*right);
            // short-circuit operators fold on the left operand alone
            if matches!(op, BinaryOp::And | BinaryOp::Or) {
                if let Some(literal) = as_literal(&left) {
                    let truthy = literal_value(literal).is_truthy();
                    let take_left = (op == BinaryOp::And) != truthy;
                    return if take_left { left } else { right };
                }
            } else if let (Some(l), Some(r)) = (as_literal(&left), as_literal(&right)) {
                let result = eval::binary_op(op, &literal_value(l), &literal_value(r));
                if let Some(literal) = result.ok().as_ref().and_then(value_literal) {
                    return Expr::new(ExprKind::Literal(literal), span);
                }
            }
            Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            )
        }
        ExprKind::Ternary {
            then,
            cond,
            otherwise,
        } => {
            let cond = fold_expr(*cond);
            let then = fold_expr(*then);
            let otherwise = otherwise.map(|e| Box::new(fold_expr(*e)));
            match (as_literal(&cond).map(|l| literal_value(l).is_truthy()), otherwise) {
                (Some(true), _) => then,
                (Some(false), Some(expr)) => *expr,
                // a false condition with no else-arm yields undefined, which
                // has no literal form; leave the node for the evaluator
                (_, otherwise) => Expr::new(
                    ExprKind::Ternary {
                        then: Box::new(then),
                        cond: Box::new(cond),
                        otherwise,
                    },
                    span,
                ),
            }
        }
        ExprKind::Array(items) => Expr::new(
            ExprKind::Array(items.into_iter().map(fold_expr).collect()),
            span,
        ),
        ExprKind::Map(entries) => Expr::new(
            ExprKind::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (fold_expr(k), fold_expr(v)))
                    .collect(),
            ),
            span,
        ),
        ExprKind::Filter { value, name, args } => Expr::new(
            ExprKind::Filter {
                value: Box::new(fold_expr(*value)),
                name,
                args: args.into_iter().map(fold_arg).collect(),
            },
            span,
        ),
        ExprKind::Test {
            value,
            name,
            args,
            negated,
        } => Expr::new(
            ExprKind::Test {
                value: Box::new(fold_expr(*value)),
                name,
                args: args.into_iter().map(fold_arg).collect(),
                negated,
            },
            span,
        ),
        ExprKind::Attr { base, name } => Expr::new(
            ExprKind::Attr {
                base: Box::new(fold_expr(*base)),
                name,
            },
            span,
        ),
        ExprKind::Index { base, key } => Expr::new(
            ExprKind::Index {
                base: Box::new(fold_expr(*base)),
                key: Box::new(fold_expr(*key)),
            },
            span,
        ),
        ExprKind::Slice {
            base,
            start,
            stop,
            step,
        } => Expr::new(
            ExprKind::Slice {
                base: Box::new(fold_expr(*base)),
                start: start.map(|e| Box::new(fold_expr(*e))),
                stop: stop.map(|e| Box::new(fold_expr(*e))),
                step: step.map(|e| Box::new(fold_expr(*e))),
            },
            span,
        ),
        ExprKind::Call { callee, args } => Expr::new(
            ExprKind::Call {
                callee: Box::new(fold_expr(*callee)),
                args: args.into_iter().map(fold_arg).collect(),
            },
            span,
        ),
        kind @ (ExprKind::Literal(_) | ExprKind::Var(_)) => Expr::new(kind, span),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        parse(source, &Options::default()).expect("template should parse")
    }

    fn parse_err(source: &str) -> ParseError {
        parse(source, &Options::default()).expect_err("template should not parse")
    }

    #[test]
    fn test_text_only() {
        let program = parse_ok("hello");
        assert!(matches!(&program.body[..], [Stmt::Text(t)] if t == "hello"));
    }

    #[test]
    fn test_emit_variable() {
        let program = parse_ok("{{ name }}");
        match &program.body[..] {
            [Stmt::Emit(expr)] => assert!(matches!(&expr.kind, ExprKind::Var(n) if n == "name")),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        // 2 + 3 * 4 parses as 2 + (3 * 4) and folds to 14
        let program = parse_ok("{{ a + 3 * 4 }}");
        match &program.body[..] {
            [Stmt::Emit(expr)] => match &expr.kind {
                ExprKind::Binary { op, right, .. } => {
                    assert_eq!(*op, BinaryOp::Add);
                    assert!(matches!(
                        &right.kind,
                        ExprKind::Literal(Literal::Int(12))
                    ));
                }
                other => panic!("unexpected expr: {:?}", other),
            },
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_power_is_right_associative() {
        let program = parse_ok("{{ 2 ** 3 ** 2 }}");
        // fully literal, so it folds: 2 ** (3 ** 2) = 512
        assert!(matches!(&program.body[..], [Stmt::Text(t)] if t == "512"));
    }

    #[test]
    fn test_constant_folding_arithmetic_and_concat() {
        let program = parse_ok("{{ 2 + 3 * 4 }}|{{ 'a' ~ 1 ~ true }}|{{ not false }}");
        match &program.body[..] {
            [Stmt::Text(t)] => assert_eq!(t, "14|a1true|true"),
            other => panic!("expected folded text, got: {:?}", other),
        }
    }

    #[test]
    fn test_folding_skips_division_by_zero() {
        let program = parse_ok("{{ 1 // 0 }}");
        assert!(matches!(&program.body[..], [Stmt::Emit(_)]));
    }

    #[test]
    fn test_if_with_literal_condition_collapses() {
        let program = parse_ok("{% if true %}a{% else %}b{% endif %}");
        assert!(matches!(&program.body[..], [Stmt::Text(t)] if t == "a"));

        let program = parse_ok("{% if 0 %}a{% else %}b{% endif %}");
        assert!(matches!(&program.body[..], [Stmt::Text(t)] if t == "b"));
    }

    #[test]
    fn test_short_circuit_folding_keeps_dynamic_side() {
        let program = parse_ok("{{ false and x }}{{ true and x }}");
        match &program.body[..] {
            [Stmt::Text(t), Stmt::Emit(expr)] => {
                assert_eq!(t, "false");
                assert!(matches!(&expr.kind, ExprKind::Var(n) if n == "x"));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_elif_chain() {
        let program = parse_ok("{% if a %}1{% elif b %}2{% else %}3{% endif %}");
        match &program.body[..] {
            [Stmt::If { else_body, .. }] => {
                assert!(matches!(&else_body[..], [Stmt::If { .. }]));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_for_with_filter_and_else() {
        let program = parse_ok("{% for x in xs if x %}{{ x }}{% else %}none{% endfor %}");
        match &program.body[..] {
            [Stmt::For {
                target,
                filter,
                else_body,
                ..
            }] => {
                assert_eq!(*target, LoopTarget::Name("x".into()));
                assert!(filter.is_some());
                assert!(matches!(&else_body[..], [Stmt::Text(t)] if t == "none"));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_for_tuple_target() {
        let program = parse_ok("{% for k, v in m %}{% endfor %}");
        match &program.body[..] {
            [Stmt::For { target, .. }] => {
                assert_eq!(
                    *target,
                    LoopTarget::Tuple(vec!["k".to_string(), "v".to_string()])
                );
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_set_forms() {
        assert!(matches!(
            &parse_ok("{% set x = 1 %}").body[..],
            [Stmt::Set {
                target: LoopTarget::Name(_),
                ..
            }]
        ));
        assert!(matches!(
            &parse_ok("{% set a, b = pair %}").body[..],
            [Stmt::Set {
                target: LoopTarget::Tuple(_),
                ..
            }]
        ));
        assert!(matches!(
            &parse_ok("{% set ns.count = 1 %}").body[..],
            [Stmt::SetAttr { .. }]
        ));
        assert!(matches!(
            &parse_ok("{% set x %}body{% endset %}").body[..],
            [Stmt::SetBlock { .. }]
        ));
    }

    #[test]
    fn test_macro_with_defaults() {
        let program = parse_ok("{% macro greet(name, greeting='Hello') %}x{% endmacro %}");
        match &program.body[..] {
            [Stmt::Macro(decl)] => {
                assert_eq!(decl.name, "greet");
                assert_eq!(decl.params.len(), 2);
                assert!(decl.params[0].default.is_none());
                assert!(decl.params[1].default.is_some());
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_filter_block_chain() {
        let program = parse_ok("{% filter upper | trim %}x{% endfilter %}");
        match &program.body[..] {
            [Stmt::FilterBlock { filters, .. }] => {
                let names: Vec<_> = filters.iter().map(|f| f.name.as_str()).collect();
                assert_eq!(names, vec!["upper", "trim"]);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_test_with_bare_argument() {
        let program = parse_ok("{% if x is divisibleby 3 %}y{% endif %}");
        match &program.body[..] {
            [Stmt::If { cond, .. }] => match &cond.kind {
                ExprKind::Test { name, args, .. } => {
                    assert_eq!(name, "divisibleby");
                    assert_eq!(args.len(), 1);
                }
                other => panic!("unexpected cond: {:?}", other),
            },
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_is_not() {
        let program = parse_ok("{{ x is not defined }}");
        match &program.body[..] {
            [Stmt::Emit(expr)] => {
                assert!(matches!(&expr.kind, ExprKind::Test { negated: true, .. }));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_slice_forms() {
        for source in ["{{ a[1:2] }}", "{{ a[:2] }}", "{{ a[::2] }}", "{{ a[1:] }}"] {
            let program = parse(source, &Options::default()).unwrap();
            assert!(
                matches!(
                    &program.body[..],
                    [Stmt::Emit(Expr {
                        kind: ExprKind::Slice { .. },
                        ..
                    })]
                ),
                "no slice for {}",
                source
            );
        }
        assert!(matches!(
            &parse_ok("{{ a[1] }}").body[..],
            [Stmt::Emit(Expr {
                kind: ExprKind::Index { .. },
                ..
            })]
        ));
    }

    #[test]
    fn test_call_with_keyword_arguments() {
        let program = parse_ok("{{ f(1, x=2) }}");
        match &program.body[..] {
            [Stmt::Emit(expr)] => match &expr.kind {
                ExprKind::Call { args, .. } => {
                    assert!(matches!(&args[0], Arg::Pos(_)));
                    assert!(matches!(&args[1], Arg::Kw(name, _) if name == "x"));
                }
                other => panic!("unexpected expr: {:?}", other),
            },
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_end_tag() {
        assert!(matches!(
            parse_err("{% if x %}{% endfor %}"),
            ParseError::MismatchedEndTag { found, .. } if found == "endfor"
        ));
        assert!(matches!(
            parse_err("{% endif %}"),
            ParseError::MismatchedEndTag { .. }
        ));
    }

    #[test]
    fn test_missing_end_tag() {
        assert!(matches!(
            parse_err("{% for x in xs %}"),
            ParseError::UnexpectedEof { .. }
        ));
    }

    #[test]
    fn test_break_outside_loop() {
        assert!(matches!(
            parse_err("{% break %}"),
            ParseError::OrphanedLoopControl {
                keyword: "break",
                ..
            }
        ));
        assert!(parse("{% for x in xs %}{% break %}{% endfor %}", &Options::default()).is_ok());
    }

    #[test]
    fn test_break_in_macro_body_does_not_see_outer_loop() {
        assert!(matches!(
            parse_err("{% for x in xs %}{% macro m() %}{% break %}{% endmacro %}{% endfor %}"),
            ParseError::OrphanedLoopControl { .. }
        ));
    }

    #[test]
    fn test_ternary_without_else() {
        assert!(matches!(
            &parse_ok("{{ a if c }}").body[..],
            [Stmt::Emit(Expr {
                kind: ExprKind::Ternary {
                    otherwise: None,
                    ..
                },
                ..
            })]
        ));
    }
}
