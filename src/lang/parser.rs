//! Recursive-descent parser for Guion source text.
//!
//! The grammar is a small brace-delimited dynamic language:
//!
//! ```text
//! def triangle(a: int, b: int, c: int) -> str {
//!     if a == b and b == c { return "equilateral" }
//!     return "scalene"
//! }
//! ```
//!
//! Parse errors carry line and column and abort module loading; they are a
//! setup failure, never a per-test failure.

use std::fmt;

use super::ast::{
    AssignTarget, BinaryOp, BoolOp, ClassDef, CompareOp, ExceptHandler, Expr, FunctionDef,
    Literal, ModuleAst, Param, Stmt, TypeExpr, UnaryOp,
};

/// Error raised when source text cannot be tokenized or parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl ParseError {
    fn new(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    // punctuation and operators
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Arrow,
    Assign,
    Pipe,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: u32,
    column: u32,
}

fn tokenize(source: &str) -> ParseResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1u32;
    let mut column = 1u32;

    macro_rules! push {
        ($tok:expr, $line:expr, $col:expr) => {
            tokens.push(Token {
                tok: $tok,
                line: $line,
                column: $col,
            })
        };
    }

    while let Some(&c) = chars.peek() {
        let (tok_line, tok_col) = (line, column);
        match c {
            '\n' => {
                chars.next();
                line += 1;
                column = 1;
            }
            ' ' | '\t' | '\r' => {
                chars.next();
                column += 1;
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '"' => {
                chars.next();
                column += 1;
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => {
                            column += 1;
                            break;
                        }
                        Some('\\') => {
                            column += 2;
                            match chars.next() {
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                Some('"') => text.push('"'),
                                Some('\\') => text.push('\\'),
                                other => {
                                    return Err(ParseError::new(
                                        line,
                                        column,
                                        format!("invalid escape {other:?}"),
                                    ))
                                }
                            }
                        }
                        Some('\n') | None => {
                            return Err(ParseError::new(line, column, "unterminated string"))
                        }
                        Some(c) => {
                            column += 1;
                            text.push(c);
                        }
                    }
                }
                push!(Tok::Str(text), tok_line, tok_col);
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        chars.next();
                        column += 1;
                    } else if c == '.' && !is_float {
                        // lookahead: `1.foo` is attribute access on an int
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                            is_float = true;
                            text.push('.');
                            chars.next();
                            column += 1;
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                let tok = if is_float {
                    Tok::Float(text.parse().map_err(|_| {
                        ParseError::new(tok_line, tok_col, format!("invalid float literal {text}"))
                    })?)
                } else {
                    Tok::Int(text.parse().map_err(|_| {
                        ParseError::new(tok_line, tok_col, format!("invalid int literal {text}"))
                    })?)
                };
                push!(tok, tok_line, tok_col);
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                push!(Tok::Ident(ident), tok_line, tok_col);
            }
            _ => {
                chars.next();
                column += 1;
                let tok = match c {
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    ',' => Tok::Comma,
                    ':' => Tok::Colon,
                    '.' => Tok::Dot,
                    '|' => Tok::Pipe,
                    '+' => Tok::Plus,
                    '*' => Tok::Star,
                    '/' => Tok::Slash,
                    '%' => Tok::Percent,
                    '-' => {
                        if chars.peek() == Some(&'>') {
                            chars.next();
                            column += 1;
                            Tok::Arrow
                        } else {
                            Tok::Minus
                        }
                    }
                    '=' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            column += 1;
                            Tok::EqEq
                        } else {
                            Tok::Assign
                        }
                    }
                    '!' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            column += 1;
                            Tok::NotEq
                        } else {
                            return Err(ParseError::new(tok_line, tok_col, "unexpected '!'"));
                        }
                    }
                    '<' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            column += 1;
                            Tok::Le
                        } else {
                            Tok::Lt
                        }
                    }
                    '>' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            column += 1;
                            Tok::Ge
                        } else {
                            Tok::Gt
                        }
                    }
                    other => {
                        return Err(ParseError::new(
                            tok_line,
                            tok_col,
                            format!("unexpected character {other:?}"),
                        ))
                    }
                };
                push!(tok, tok_line, tok_col);
            }
        }
    }
    push!(Tok::Eof, line, column);
    Ok(tokens)
}

/// Parses a complete module.
pub fn parse_module(name: &str, source: &str) -> ParseResult<ModuleAst> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.module(name)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, tok: &Tok) -> bool {
        &self.peek().tok == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> ParseResult<Token> {
        if self.check(&tok) {
            Ok(self.advance())
        } else {
            let found = self.peek();
            Err(ParseError::new(
                found.line,
                found.column,
                format!("expected {what}, found {:?}", found.tok),
            ))
        }
    }

    fn ident(&mut self, what: &str) -> ParseResult<(String, u32)> {
        let token = self.peek().clone();
        match token.tok {
            Tok::Ident(name) => {
                self.advance();
                Ok((name, token.line))
            }
            _ => Err(ParseError::new(
                token.line,
                token.column,
                format!("expected {what}, found {:?}", token.tok),
            )),
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().tok, Tok::Ident(name) if name == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn module(&mut self, name: &str) -> ParseResult<ModuleAst> {
        let mut functions = Vec::new();
        let mut classes = Vec::new();
        while !self.check(&Tok::Eof) {
            if self.at_keyword("def") {
                functions.push(self.function_def()?);
            } else if self.at_keyword("class") {
                classes.push(self.class_def()?);
            } else {
                let found = self.peek();
                return Err(ParseError::new(
                    found.line,
                    found.column,
                    format!("expected 'def' or 'class', found {:?}", found.tok),
                ));
            }
        }
        Ok(ModuleAst {
            name: name.to_string(),
            functions,
            classes,
        })
    }

    fn class_def(&mut self) -> ParseResult<ClassDef> {
        let kw = self.advance();
        let (name, _) = self.ident("class name")?;
        self.expect(Tok::LBrace, "'{'")?;
        let mut methods = Vec::new();
        while !self.eat(&Tok::RBrace) {
            if !self.at_keyword("def") {
                let found = self.peek();
                return Err(ParseError::new(
                    found.line,
                    found.column,
                    "expected method definition in class body",
                ));
            }
            methods.push(self.function_def()?);
        }
        Ok(ClassDef {
            name,
            methods,
            line: kw.line,
        })
    }

    fn function_def(&mut self) -> ParseResult<FunctionDef> {
        let kw = self.advance();
        let (name, _) = self.ident("function name")?;
        self.expect(Tok::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&Tok::RParen) {
            loop {
                let (pname, _) = self.ident("parameter name")?;
                let annotation = if self.eat(&Tok::Colon) {
                    Some(self.type_expr()?)
                } else {
                    None
                };
                let default = if self.eat(&Tok::Assign) {
                    Some(self.literal()?)
                } else {
                    None
                };
                params.push(Param {
                    name: pname,
                    annotation,
                    default,
                });
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "')'")?;
        let return_type = if self.eat(&Tok::Arrow) {
            Some(self.type_expr()?)
        } else {
            None
        };
        let body = self.block()?;
        Ok(FunctionDef {
            name,
            params,
            return_type,
            body,
            line: kw.line,
        })
    }

    fn type_expr(&mut self) -> ParseResult<TypeExpr> {
        let (first, _) = self.ident("type name")?;
        let mut parts = vec![TypeExpr::Name(first)];
        while self.eat(&Tok::Pipe) {
            let (next, _) = self.ident("type name")?;
            parts.push(TypeExpr::Name(next));
        }
        if parts.len() == 1 {
            Ok(parts.pop().expect("nonempty"))
        } else {
            Ok(TypeExpr::Union(parts))
        }
    }

    fn literal(&mut self) -> ParseResult<Literal> {
        let token = self.advance();
        match token.tok {
            Tok::Int(v) => Ok(Literal::Int(v)),
            Tok::Float(v) => Ok(Literal::Float(v)),
            Tok::Str(v) => Ok(Literal::Str(v)),
            Tok::Minus => match self.advance().tok {
                Tok::Int(v) => Ok(Literal::Int(-v)),
                Tok::Float(v) => Ok(Literal::Float(-v)),
                other => Err(ParseError::new(
                    token.line,
                    token.column,
                    format!("expected numeric literal after '-', found {other:?}"),
                )),
            },
            Tok::Ident(name) => match name.as_str() {
                "true" => Ok(Literal::Bool(true)),
                "false" => Ok(Literal::Bool(false)),
                "none" => Ok(Literal::None),
                other => Err(ParseError::new(
                    token.line,
                    token.column,
                    format!("expected literal, found identifier {other}"),
                )),
            },
            other => Err(ParseError::new(
                token.line,
                token.column,
                format!("expected literal, found {other:?}"),
            )),
        }
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(Tok::LBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.eat(&Tok::RBrace) {
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        let token = self.peek().clone();
        let line = token.line;
        if self.eat_keyword("if") {
            return self.if_tail(line);
        }
        if self.eat_keyword("while") {
            let test = self.expression()?;
            let body = self.block()?;
            return Ok(Stmt::While { test, body, line });
        }
        if self.eat_keyword("for") {
            let (var, _) = self.ident("loop variable")?;
            if !self.eat_keyword("in") {
                return Err(ParseError::new(line, token.column, "expected 'in' in for loop"));
            }
            let iter = self.expression()?;
            let body = self.block()?;
            return Ok(Stmt::For {
                var,
                iter,
                body,
                line,
            });
        }
        if self.eat_keyword("try") {
            let body = self.block()?;
            let mut handlers = Vec::new();
            while self.at_keyword("except") {
                let except_tok = self.advance();
                let (exc_type, _) = self.ident("exception type")?;
                let handler_body = self.block()?;
                handlers.push(ExceptHandler {
                    exc_type,
                    body: handler_body,
                    line: except_tok.line,
                });
            }
            if handlers.is_empty() {
                return Err(ParseError::new(line, token.column, "try without except"));
            }
            return Ok(Stmt::Try {
                body,
                handlers,
                line,
            });
        }
        if self.eat_keyword("return") {
            let value = if self.check(&Tok::RBrace) {
                None
            } else {
                Some(self.expression()?)
            };
            return Ok(Stmt::Return { value, line });
        }
        if self.eat_keyword("raise") {
            let exc = self.expression()?;
            return Ok(Stmt::Raise { exc, line });
        }
        if self.eat_keyword("break") {
            return Ok(Stmt::Break { line });
        }
        if self.eat_keyword("continue") {
            return Ok(Stmt::Continue { line });
        }
        // assignment or expression statement
        let expr = self.expression()?;
        if self.eat(&Tok::Assign) {
            let target = match expr {
                Expr::Name(name) => AssignTarget::Name(name),
                Expr::Attribute { object, name } => AssignTarget::Attr {
                    object: *object,
                    name,
                },
                Expr::Index { object, index } => AssignTarget::Index {
                    object: *object,
                    index: *index,
                },
                _ => {
                    return Err(ParseError::new(
                        line,
                        token.column,
                        "invalid assignment target",
                    ))
                }
            };
            let value = self.expression()?;
            return Ok(Stmt::Assign {
                target,
                value,
                line,
            });
        }
        Ok(Stmt::Expr { value: expr, line })
    }

    fn if_tail(&mut self, line: u32) -> ParseResult<Stmt> {
        let test = self.expression()?;
        let then_body = self.block()?;
        let else_body = if self.eat_keyword("elif") {
            let elif_line = self.tokens[self.pos - 1].line;
            vec![self.if_tail(elif_line)?]
        } else if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            test,
            then_body,
            else_body,
            line,
        })
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> ParseResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::Bool {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ParseResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::Bool {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword("not") {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let left = self.arith()?;
        let op = if self.eat(&Tok::EqEq) {
            Some(CompareOp::Eq)
        } else if self.eat(&Tok::NotEq) {
            Some(CompareOp::Ne)
        } else if self.eat(&Tok::Le) {
            Some(CompareOp::Le)
        } else if self.eat(&Tok::Lt) {
            Some(CompareOp::Lt)
        } else if self.eat(&Tok::Ge) {
            Some(CompareOp::Ge)
        } else if self.eat(&Tok::Gt) {
            Some(CompareOp::Gt)
        } else if self.at_keyword("in") {
            self.advance();
            Some(CompareOp::In)
        } else if self.at_keyword("is") {
            self.advance();
            Some(CompareOp::Is)
        } else {
            None
        };
        match op {
            Some(op) => {
                let right = self.arith()?;
                Ok(Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            None => Ok(left),
        }
    }

    fn arith(&mut self) -> ParseResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat(&Tok::Plus) {
                BinaryOp::Add
            } else if self.eat(&Tok::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat(&Tok::Star) {
                BinaryOp::Mul
            } else if self.eat(&Tok::Slash) {
                BinaryOp::Div
            } else if self.eat(&Tok::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat(&Tok::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Tok::Dot) {
                let (name, _) = self.ident("attribute name")?;
                if self.check(&Tok::LParen) {
                    let (args, kwargs) = self.call_args()?;
                    if !kwargs.is_empty() {
                        let found = self.peek();
                        return Err(ParseError::new(
                            found.line,
                            found.column,
                            "keyword arguments are not supported on method calls",
                        ));
                    }
                    expr = Expr::MethodCall {
                        object: Box::new(expr),
                        method: name,
                        args,
                    };
                } else {
                    expr = Expr::Attribute {
                        object: Box::new(expr),
                        name,
                    };
                }
            } else if self.eat(&Tok::LBracket) {
                let index = self.expression()?;
                self.expect(Tok::RBracket, "']'")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> ParseResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        self.expect(Tok::LParen, "'('")?;
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        if !self.check(&Tok::RParen) {
            loop {
                // keyword argument: ident '=' expr (but not ident '==')
                let is_kwarg = matches!(&self.peek().tok, Tok::Ident(_))
                    && matches!(self.tokens.get(self.pos + 1).map(|t| &t.tok), Some(Tok::Assign));
                if is_kwarg {
                    let (name, kw_line) = self.ident("keyword name")?;
                    self.expect(Tok::Assign, "'='")?;
                    let value = self.expression()?;
                    if kwargs.iter().any(|(n, _)| n == &name) {
                        return Err(ParseError::new(
                            kw_line,
                            0,
                            format!("duplicate keyword argument {name}"),
                        ));
                    }
                    kwargs.push((name, value));
                } else {
                    if !kwargs.is_empty() {
                        let found = self.peek();
                        return Err(ParseError::new(
                            found.line,
                            found.column,
                            "positional argument after keyword argument",
                        ));
                    }
                    args.push(self.expression()?);
                }
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "')'")?;
        Ok((args, kwargs))
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        match token.tok {
            Tok::Int(v) => {
                self.advance();
                Ok(Expr::Literal(Literal::Int(v)))
            }
            Tok::Float(v) => {
                self.advance();
                Ok(Expr::Literal(Literal::Float(v)))
            }
            Tok::Str(ref v) => {
                let v = v.clone();
                self.advance();
                Ok(Expr::Literal(Literal::Str(v)))
            }
            Tok::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Tok::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Tok::RBracket, "']'")?;
                Ok(Expr::ListLit(items))
            }
            Tok::Ident(ref name) => {
                let name = name.clone();
                self.advance();
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Literal::Bool(true))),
                    "false" => Ok(Expr::Literal(Literal::Bool(false))),
                    "none" => Ok(Expr::Literal(Literal::None)),
                    _ => {
                        if self.check(&Tok::LParen) {
                            let (args, kwargs) = self.call_args()?;
                            Ok(Expr::Call {
                                function: name,
                                args,
                                kwargs,
                            })
                        } else {
                            Ok(Expr::Name(name))
                        }
                    }
                }
            }
            other => Err(ParseError::new(
                token.line,
                token.column,
                format!("expected expression, found {other:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_annotated_function() {
        let module = parse_module(
            "triangle",
            r#"
def triangle(a: int, b: int, c: int) -> str {
    if a == b and b == c { return "equilateral" }
    return "scalene"
}
"#,
        )
        .expect("parse");
        assert_eq!(module.functions.len(), 1);
        let function = &module.functions[0];
        assert_eq!(function.name, "triangle");
        assert_eq!(function.params.len(), 3);
        assert_eq!(
            function.params[0].annotation,
            Some(TypeExpr::Name("int".to_string()))
        );
        assert_eq!(function.return_type, Some(TypeExpr::Name("str".to_string())));
    }

    #[test]
    fn parses_class_with_methods() {
        let module = parse_module(
            "queue",
            r#"
class Queue {
    def init(self) { self.items = [] }
    def enqueue(self, value: int) { self.items.append(value) }
    def size(self) -> int { return len(self.items) }
}
"#,
        )
        .expect("parse");
        assert_eq!(module.classes.len(), 1);
        assert_eq!(module.classes[0].methods.len(), 3);
    }

    #[test]
    fn parses_try_except_and_raise() {
        let module = parse_module(
            "safe",
            r#"
def safe_div(a: int, b: int) -> float {
    if b == 0 { raise ZeroDivisionError("division by zero") }
    return a / b
}
def guarded(a: int, b: int) -> float {
    try { return safe_div(a, b) } except ZeroDivisionError { return 0.0 }
}
"#,
        )
        .expect("parse");
        assert_eq!(module.functions.len(), 2);
        assert!(matches!(module.functions[1].body[0], Stmt::Try { .. }));
    }

    #[test]
    fn parses_union_annotation_and_default() {
        let module = parse_module(
            "opt",
            "def head(items: list, fallback: int | none = none) -> int | none { return fallback }",
        )
        .expect("parse");
        let param = &module.functions[0].params[1];
        assert!(matches!(param.annotation, Some(TypeExpr::Union(_))));
        assert_eq!(param.default, Some(Literal::None));
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = parse_module("bad", "def f() { return \"oops }").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn keyword_arguments_parse_in_calls() {
        let module =
            parse_module("kw", "def f() { return g(1, fallback=2) }").expect("parse");
        match &module.functions[0].body[0] {
            Stmt::Return {
                value: Some(Expr::Call { args, kwargs, .. }),
                ..
            } => {
                assert_eq!(args.len(), 1);
                assert_eq!(kwargs.len(), 1);
                assert_eq!(kwargs[0].0, "fallback");
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }
}
