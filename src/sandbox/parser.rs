//! Expression parser for the sandboxed evaluator.
//!
//! Parses the JavaScript-flavored expression subset used by stop
//! conditions and templated variables into a small AST. The grammar is a
//! strict subset of ECMAScript expressions: literals, identifiers,
//! member/index access (with optional chaining), calls, unary and binary
//! operators, ternaries, and array literals. No assignment, no
//! statements beyond a single `return`, no function definitions other
//! than the outer arrow.

use crate::error::{Error, Result};

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
}

/// Binary operators (non-short-circuiting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    EqLoose,
    NeLoose,
    EqStrict,
    NeStrict,
}

/// Short-circuiting operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    /// `??` (nullish coalescing).
    Nullish,
}

/// Expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    Str(String),
    Ident(String),
    Array(Vec<Expr>),
    /// `object.property`; `optional` is true for `?.`.
    Member {
        object: Box<Expr>,
        property: String,
        optional: bool,
    },
    /// `object[index]`.
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        optional: bool,
    },
    /// `callee(args…)`.
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        optional: bool,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Ternary {
        condition: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
}

/// A parsed arrow function: parameter names plus a body expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrowFn {
    pub params: Vec<String>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    Eof,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            tokens: Vec::new(),
        }
    }

    fn lex(mut self) -> Result<Vec<Token>> {
        while let Some(&c) = self.chars.peek() {
            match c {
                ' ' | '\t' | '\n' | '\r' => {
                    self.chars.next();
                }
                '0'..='9' => self.lex_number()?,
                '"' | '\'' => self.lex_string(c)?,
                'a'..='z' | 'A'..='Z' | '_' | '$' => self.lex_ident(),
                _ => self.lex_punct()?,
            }
        }
        self.tokens.push(Token::Eof);
        Ok(self.tokens)
    }

    fn lex_number(&mut self) -> Result<()> {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                text.push(c);
                self.chars.next();
            } else if (c == '+' || c == '-') && (text.ends_with('e') || text.ends_with('E')) {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        let value: f64 = text
            .parse()
            .map_err(|_| Error::Sandbox(format!("invalid number literal: {text}")))?;
        self.tokens.push(Token::Number(value));
        Ok(())
    }

    fn lex_string(&mut self, quote: char) -> Result<()> {
        self.chars.next();
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some(c) if c == quote => break,
                Some('\\') => match self.chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some(other) => text.push(other),
                    None => return Err(Error::Sandbox("unterminated string literal".into())),
                },
                Some(c) => text.push(c),
                None => return Err(Error::Sandbox("unterminated string literal".into())),
            }
        }
        self.tokens.push(Token::Str(text));
        Ok(())
    }

    fn lex_ident(&mut self) {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        self.tokens.push(Token::Ident(text));
    }

    fn lex_punct(&mut self) -> Result<()> {
        let c = self.chars.next().expect("peeked");
        let next = self.chars.peek().copied();
        let punct: &'static str = match (c, next) {
            ('=', Some('=')) => {
                self.chars.next();
                if self.chars.peek() == Some(&'=') {
                    self.chars.next();
                    "==="
                } else {
                    "=="
                }
            }
            ('=', Some('>')) => {
                self.chars.next();
                "=>"
            }
            ('!', Some('=')) => {
                self.chars.next();
                if self.chars.peek() == Some(&'=') {
                    self.chars.next();
                    "!=="
                } else {
                    "!="
                }
            }
            ('<', Some('=')) => {
                self.chars.next();
                "<="
            }
            ('>', Some('=')) => {
                self.chars.next();
                ">="
            }
            ('&', Some('&')) => {
                self.chars.next();
                "&&"
            }
            ('|', Some('|')) => {
                self.chars.next();
                "||"
            }
            ('?', Some('?')) => {
                self.chars.next();
                "??"
            }
            ('?', Some('.')) => {
                self.chars.next();
                "?."
            }
            ('!', _) => "!",
            ('<', _) => "<",
            ('>', _) => ">",
            ('?', _) => "?",
            (':', _) => ":",
            ('+', _) => "+",
            ('-', _) => "-",
            ('*', _) => "*",
            ('/', _) => "/",
            ('%', _) => "%",
            ('(', _) => "(",
            (')', _) => ")",
            ('[', _) => "[",
            (']', _) => "]",
            ('{', _) => "{",
            ('}', _) => "}",
            ('.', _) => ".",
            (',', _) => ",",
            (';', _) => ";",
            (other, _) => {
                return Err(Error::Sandbox(format!(
                    "unexpected character in expression: {other:?}"
                )))
            }
        };
        self.tokens.push(Token::Punct(punct));
        Ok(())
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        token
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Token::Punct(p) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(Error::Sandbox(format!(
                "expected {punct:?}, found {:?}",
                self.peek()
            )))
        }
    }

    /// Entry point: a full arrow function `(a, b) => body`.
    fn parse_arrow(&mut self) -> Result<ArrowFn> {
        let params = self.parse_params()?;
        self.expect_punct("=>")?;
        let body = if self.eat_punct("{") {
            // `{ return EXPR; }` is the only statement form allowed.
            match self.advance() {
                Token::Ident(word) if word == "return" => {}
                other => {
                    return Err(Error::Sandbox(format!(
                        "expected return statement in block body, found {other:?}"
                    )))
                }
            }
            let expr = self.parse_expr()?;
            self.eat_punct(";");
            self.expect_punct("}")?;
            expr
        } else {
            self.parse_expr()?
        };
        match self.peek() {
            Token::Eof => Ok(ArrowFn { params, body }),
            other => Err(Error::Sandbox(format!(
                "unexpected trailing input: {other:?}"
            ))),
        }
    }

    fn parse_params(&mut self) -> Result<Vec<String>> {
        let mut params = Vec::new();
        if self.eat_punct("(") {
            if !self.eat_punct(")") {
                loop {
                    match self.advance() {
                        Token::Ident(name) => params.push(name),
                        other => {
                            return Err(Error::Sandbox(format!(
                                "expected parameter name, found {other:?}"
                            )))
                        }
                    }
                    if self.eat_punct(")") {
                        break;
                    }
                    self.expect_punct(",")?;
                }
            }
        } else {
            // Single bare parameter: `x => …`
            match self.advance() {
                Token::Ident(name) => params.push(name),
                other => {
                    return Err(Error::Sandbox(format!(
                        "expected parameter name, found {other:?}"
                    )))
                }
            }
        }
        Ok(params)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr> {
        let condition = self.parse_nullish()?;
        if self.eat_punct("?") {
            let consequent = self.parse_expr()?;
            self.expect_punct(":")?;
            let alternate = self.parse_expr()?;
            Ok(Expr::Ternary {
                condition: Box::new(condition),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            })
        } else {
            Ok(condition)
        }
    }

    fn parse_nullish(&mut self) -> Result<Expr> {
        let mut left = self.parse_or()?;
        while self.eat_punct("??") {
            let right = self.parse_or()?;
            left = Expr::Logical(LogicalOp::Nullish, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_punct("||") {
            let right = self.parse_and()?;
            left = Expr::Logical(LogicalOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat_punct("&&") {
            let right = self.parse_equality()?;
            left = Expr::Logical(LogicalOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.eat_punct("===") {
                BinaryOp::EqStrict
            } else if self.eat_punct("!==") {
                BinaryOp::NeStrict
            } else if self.eat_punct("==") {
                BinaryOp::EqLoose
            } else if self.eat_punct("!=") {
                BinaryOp::NeLoose
            } else {
                return Ok(left);
            };
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.eat_punct("<=") {
                BinaryOp::Le
            } else if self.eat_punct(">=") {
                BinaryOp::Ge
            } else if self.eat_punct("<") {
                BinaryOp::Lt
            } else if self.eat_punct(">") {
                BinaryOp::Gt
            } else {
                return Ok(left);
            };
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_punct("+") {
                BinaryOp::Add
            } else if self.eat_punct("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat_punct("*") {
                BinaryOp::Mul
            } else if self.eat_punct("/") {
                BinaryOp::Div
            } else if self.eat_punct("%") {
                BinaryOp::Rem
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_punct("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)));
        }
        if self.eat_punct("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)));
        }
        if self.eat_punct("+") {
            return Ok(Expr::Unary(UnaryOp::Plus, Box::new(self.parse_unary()?)));
        }
        if matches!(self.peek(), Token::Ident(word) if word == "typeof") {
            self.advance();
            return Ok(Expr::Unary(UnaryOp::TypeOf, Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: self.expect_ident()?,
                    optional: false,
                };
            } else if self.eat_punct("?.") {
                // `?.name`, `?.[expr]`, or `?.(args)`
                if self.eat_punct("[") {
                    let index = self.parse_expr()?;
                    self.expect_punct("]")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: true,
                    };
                } else if matches!(self.peek(), Token::Punct("(")) {
                    expr = self.parse_call(expr, true)?;
                } else {
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: self.expect_ident()?,
                        optional: true,
                    };
                }
            } else if self.eat_punct("[") {
                let index = self.parse_expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    optional: false,
                };
            } else if matches!(self.peek(), Token::Punct("(")) {
                expr = self.parse_call(expr, false)?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_call(&mut self, callee: Expr, optional: bool) -> Result<Expr> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        if !self.eat_punct(")") {
            loop {
                args.push(self.parse_expr()?);
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
            optional,
        })
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(Error::Sandbox(format!(
                "expected property name, found {other:?}"
            ))),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "undefined" => Ok(Expr::Undefined),
                _ => Ok(Expr::Ident(word)),
            },
            Token::Punct("(") => {
                let expr = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => {
                let mut items = Vec::new();
                if !self.eat_punct("]") {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.eat_punct("]") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            other => Err(Error::Sandbox(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }
}

/// Parse a full arrow-function source into its AST.
pub fn parse_arrow_fn(source: &str) -> Result<ArrowFn> {
    let tokens = Lexer::new(source).lex()?;
    Parser::new(tokens).parse_arrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simple_arrow() {
        let f = parse_arrow_fn("(response, pageInfo) => response.done").unwrap();
        assert_eq!(f.params, vec!["response", "pageInfo"]);
        assert_eq!(
            f.body,
            Expr::Member {
                object: Box::new(Expr::Ident("response".into())),
                property: "done".into(),
                optional: false,
            }
        );
    }

    #[test]
    fn test_bare_param_arrow() {
        let f = parse_arrow_fn("sourceData => sourceData.id").unwrap();
        assert_eq!(f.params, vec!["sourceData"]);
    }

    #[test]
    fn test_block_body_requires_return() {
        let f = parse_arrow_fn("(r) => { return r.count; }").unwrap();
        assert!(matches!(f.body, Expr::Member { .. }));

        let err = parse_arrow_fn("(r) => { r.count; }").unwrap_err();
        assert!(err.to_string().contains("return"));
    }

    #[test]
    fn test_operator_precedence() {
        // a + b * c parses as a + (b * c)
        let f = parse_arrow_fn("(x) => 1 + 2 * 3").unwrap();
        assert_eq!(
            f.body,
            Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Binary(
                    BinaryOp::Mul,
                    Box::new(Expr::Number(2.0)),
                    Box::new(Expr::Number(3.0)),
                )),
            )
        );
    }

    #[test]
    fn test_logical_and_comparison() {
        let f = parse_arrow_fn("(r) => r.a < 5 && r.b >= 2").unwrap();
        match f.body {
            Expr::Logical(LogicalOp::And, left, right) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::Lt, _, _)));
                assert!(matches!(*right, Expr::Binary(BinaryOp::Ge, _, _)));
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn test_strict_vs_loose_equality() {
        let f = parse_arrow_fn("(r) => r.a === null").unwrap();
        assert!(matches!(f.body, Expr::Binary(BinaryOp::EqStrict, _, _)));
        let f = parse_arrow_fn("(r) => r.a != null").unwrap();
        assert!(matches!(f.body, Expr::Binary(BinaryOp::NeLoose, _, _)));
    }

    #[test]
    fn test_optional_chaining() {
        let f = parse_arrow_fn("(r) => r.meta?.next").unwrap();
        match f.body {
            Expr::Member {
                property, optional, ..
            } => {
                assert_eq!(property, "next");
                assert!(optional);
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn test_index_and_call() {
        let f = parse_arrow_fn("(r) => r.items[0].tags.includes('done')").unwrap();
        match f.body {
            Expr::Call { args, .. } => assert_eq!(args, vec![Expr::Str("done".into())]),
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn test_ternary() {
        let f = parse_arrow_fn("(r) => r.done ? 1 : 2").unwrap();
        assert!(matches!(f.body, Expr::Ternary { .. }));
    }

    #[test]
    fn test_string_escapes() {
        let f = parse_arrow_fn(r#"(r) => "a\nb""#).unwrap();
        assert_eq!(f.body, Expr::Str("a\nb".into()));
    }

    #[test]
    fn test_typeof() {
        let f = parse_arrow_fn("(r) => typeof r.next === 'string'").unwrap();
        match f.body {
            Expr::Binary(BinaryOp::EqStrict, left, _) => {
                assert!(matches!(*left, Expr::Unary(UnaryOp::TypeOf, _)));
            }
            other => panic!("unexpected ast: {other:?}"),
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse_arrow_fn("(r) => r.a r.b").is_err());
    }

    #[test]
    fn test_number_literals() {
        let f = parse_arrow_fn("(r) => 1.5e3").unwrap();
        assert_eq!(f.body, Expr::Number(1500.0));
    }
}
