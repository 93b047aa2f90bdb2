//! Device predicate expressions.
//!
//! A small, statically checked expression language evaluated against one
//! device at a time. Expressions are compiled once ([`Predicate::compile`])
//! and evaluated many times ([`Predicate::matches`]). Compile errors are
//! permanent; evaluation errors depend on the device and are recoverable.
//!
//! # Grammar
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := unary ( ("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") unary )?
//! unary   := "!" unary | postfix
//! postfix := primary ( "." ident | "[" string "]" )*
//! primary := "true" | "false" | int | string | ident | "(" expr ")"
//! ```
//!
//! The only variable is `device`, with the fields `device.driver` and
//! `device.attributes["<domain>"].<name>`. `"<name>" in
//! device.attributes["<domain>"]` tests for presence of an attribute.
//! Attributes in the device's own driver domain may be stored unqualified.

use std::collections::BTreeMap;
use std::fmt;

use claimgrid_state::AttributeValue;

use crate::error::{CompileError, EvalError};

/// Identifier of the single variable in scope.
const DEVICE_VAR: &str = "device";

/// Upper bound on tokens per expression. Bounds the depth of `&&`/`||`
/// chains walked recursively by `check` and `eval`.
const MAX_TOKENS: usize = 512;

/// Upper bound on nested parentheses and `!` operators.
const MAX_NESTING: usize = 32;

// ── Values ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Bool(bool),
    Int(i64),
    String(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
        }
    }
}

impl From<&AttributeValue> for Value {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::Int(i) => Value::Int(*i),
            AttributeValue::String(s) => Value::String(s.clone()),
        }
    }
}

/// Static type of a subexpression. Attribute lookups are `Dyn` until
/// evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Bool,
    Int,
    String,
    Dyn,
}

impl Ty {
    fn compatible(self, other: Ty) -> bool {
        self == other || self == Ty::Dyn || other == Ty::Dyn
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Ty::Bool => "bool",
            Ty::Int => "int",
            Ty::String => "string",
            Ty::Dyn => "dyn",
        };
        f.write_str(name)
    }
}

// ── Syntax tree ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn is_equality(self) -> bool {
        matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Literal(Value),
    Driver,
    Attribute { domain: String, name: String },
    HasAttribute { domain: String, name: String },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Intermediate result of parsing a postfix chain. Only `Value` is a
/// usable operand; the others are partial paths into `device`.
#[derive(Debug)]
enum Operand {
    Value(Expr),
    Device,
    Attributes,
    Domain(String),
}

// ── Lexer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    True,
    False,
    In,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Op(CompareOp),
}

struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn syntax(offset: usize, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            offset,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, CompileError> {
        let mut tokens = Vec::new();
        while let Some(&(offset, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            let token = match c {
                '.' => self.single(Token::Dot),
                '[' => self.single(Token::LBracket),
                ']' => self.single(Token::RBracket),
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                '!' => {
                    self.chars.next();
                    if self.eat('=') {
                        Token::Op(CompareOp::Ne)
                    } else {
                        Token::Not
                    }
                }
                '=' => {
                    self.chars.next();
                    if !self.eat('=') {
                        return Err(Self::syntax(offset, "expected '=='"));
                    }
                    Token::Op(CompareOp::Eq)
                }
                '<' => {
                    self.chars.next();
                    if self.eat('=') {
                        Token::Op(CompareOp::Le)
                    } else {
                        Token::Op(CompareOp::Lt)
                    }
                }
                '>' => {
                    self.chars.next();
                    if self.eat('=') {
                        Token::Op(CompareOp::Ge)
                    } else {
                        Token::Op(CompareOp::Gt)
                    }
                }
                '&' => {
                    self.chars.next();
                    if !self.eat('&') {
                        return Err(Self::syntax(offset, "expected '&&'"));
                    }
                    Token::And
                }
                '|' => {
                    self.chars.next();
                    if !self.eat('|') {
                        return Err(Self::syntax(offset, "expected '||'"));
                    }
                    Token::Or
                }
                '"' | '\'' => self.string(offset, c)?,
                '-' | '0'..='9' => self.int(offset)?,
                c if c.is_ascii_alphabetic() || c == '_' => self.ident(offset),
                other => {
                    return Err(Self::syntax(offset, format!("unexpected character {other:?}")));
                }
            };
            tokens.push((offset, token));
        }
        Ok(tokens)
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek().is_some_and(|&(_, c)| c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn string(&mut self, offset: usize, quote: char) -> Result<Token, CompileError> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(Self::syntax(offset, "unterminated string literal")),
                Some((_, c)) if c == quote => return Ok(Token::Str(out)),
                Some((pos, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, c @ ('\\' | '"' | '\''))) => out.push(c),
                    _ => return Err(Self::syntax(pos, "invalid escape sequence")),
                },
                Some((_, c)) => out.push(c),
            }
        }
    }

    fn int(&mut self, offset: usize) -> Result<Token, CompileError> {
        let mut end = offset;
        if let Some(&(_, '-')) = self.chars.peek() {
            self.chars.next();
            end += 1;
        }
        while let Some(&(pos, c)) = self.chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            self.chars.next();
            end = pos + 1;
        }
        let text = &self.src[offset..end];
        text.parse()
            .map(Token::Int)
            .map_err(|_| Self::syntax(offset, format!("invalid integer literal {text:?}")))
    }

    fn ident(&mut self, offset: usize) -> Token {
        let mut end = offset;
        while let Some(&(pos, c)) = self.chars.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            self.chars.next();
            end = pos + c.len_utf8();
        }
        match &self.src[offset..end] {
            "true" => Token::True,
            "false" => Token::False,
            "in" => Token::In,
            other => Token::Ident(other.to_string()),
        }
    }
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(o, _)| *o)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), CompileError> {
        let offset = self.offset();
        match self.next() {
            Some(t) if t == expected => Ok(()),
            _ => Err(Lexer::syntax(offset, format!("expected {what}"))),
        }
    }

    fn new(tokens: Vec<(usize, Token)>, end: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            end,
            depth: 0,
        }
    }

    fn enter(&mut self, offset: usize) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(Lexer::syntax(
                offset,
                format!("expression nested deeper than {MAX_NESTING} levels"),
            ));
        }
        Ok(())
    }

    fn parse(mut self) -> Result<Expr, CompileError> {
        if self.tokens.is_empty() {
            return Err(Lexer::syntax(0, "empty expression"));
        }
        if let Some((offset, _)) = self.tokens.get(MAX_TOKENS) {
            return Err(Lexer::syntax(
                *offset,
                format!("expression longer than {MAX_TOKENS} tokens"),
            ));
        }
        let expr = self.or()?;
        if self.pos < self.tokens.len() {
            return Err(Lexer::syntax(self.offset(), "unexpected trailing input"));
        }
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.unary()?;
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                let rhs = self.unary()?;
                Ok(Expr::Compare {
                    op,
                    lhs: Box::new(value_of(lhs)?),
                    rhs: Box::new(value_of(rhs)?),
                })
            }
            Some(Token::In) => {
                self.pos += 1;
                let rhs = self.unary()?;
                let name = match value_of(lhs)? {
                    Expr::Literal(Value::String(name)) => name,
                    _ => {
                        return Err(CompileError::Type(
                            "left side of 'in' must be a string literal".to_string(),
                        ));
                    }
                };
                match rhs {
                    Operand::Domain(domain) => Ok(Expr::HasAttribute { domain, name }),
                    _ => Err(CompileError::Type(
                        "right side of 'in' must be device.attributes[\"<domain>\"]".to_string(),
                    )),
                }
            }
            _ => value_of(lhs),
        }
    }

    fn unary(&mut self) -> Result<Operand, CompileError> {
        if self.peek() == Some(&Token::Not) {
            self.enter(self.offset())?;
            self.pos += 1;
            let inner = value_of(self.unary()?)?;
            self.depth -= 1;
            return Ok(Operand::Value(Expr::Not(Box::new(inner))));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Operand, CompileError> {
        let mut operand = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let offset = self.offset();
                    let field = match self.next() {
                        Some(Token::Ident(field)) => field,
                        _ => return Err(Lexer::syntax(offset, "expected field name after '.'")),
                    };
                    operand = select(operand, field)?;
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let offset = self.offset();
                    let key = match self.next() {
                        Some(Token::Str(key)) => key,
                        _ => return Err(Lexer::syntax(offset, "expected string index")),
                    };
                    self.expect(Token::RBracket, "']'")?;
                    operand = select(operand, key)?;
                }
                _ => return Ok(operand),
            }
        }
    }

    fn primary(&mut self) -> Result<Operand, CompileError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::True) => Ok(Operand::Value(Expr::Literal(Value::Bool(true)))),
            Some(Token::False) => Ok(Operand::Value(Expr::Literal(Value::Bool(false)))),
            Some(Token::Int(i)) => Ok(Operand::Value(Expr::Literal(Value::Int(i)))),
            Some(Token::Str(s)) => Ok(Operand::Value(Expr::Literal(Value::String(s)))),
            Some(Token::Ident(name)) if name == DEVICE_VAR => Ok(Operand::Device),
            Some(Token::Ident(name)) => Err(CompileError::UndeclaredReference(name)),
            Some(Token::LParen) => {
                self.enter(offset)?;
                let inner = self.or()?;
                self.expect(Token::RParen, "')'")?;
                self.depth -= 1;
                Ok(Operand::Value(inner))
            }
            Some(_) => Err(Lexer::syntax(offset, "expected operand")),
            None => Err(Lexer::syntax(offset, "unexpected end of expression")),
        }
    }
}

/// Apply one `.field` or `["key"]` step to a path.
fn select(operand: Operand, field: String) -> Result<Operand, CompileError> {
    match operand {
        Operand::Device => match field.as_str() {
            "driver" => Ok(Operand::Value(Expr::Driver)),
            "attributes" => Ok(Operand::Attributes),
            _ => Err(CompileError::UndeclaredReference(format!("{DEVICE_VAR}.{field}"))),
        },
        Operand::Attributes => Ok(Operand::Domain(field)),
        Operand::Domain(domain) => Ok(Operand::Value(Expr::Attribute { domain, name: field })),
        Operand::Value(_) => Err(CompileError::Type(format!(
            "field selection '{field}' on a scalar value"
        ))),
    }
}

fn value_of(operand: Operand) -> Result<Expr, CompileError> {
    match operand {
        Operand::Value(expr) => Ok(expr),
        Operand::Device => Err(CompileError::Type("'device' is not a value".to_string())),
        Operand::Attributes => Err(CompileError::Type(
            "'device.attributes' must be indexed by domain".to_string(),
        )),
        Operand::Domain(domain) => Err(CompileError::Type(format!(
            "attribute domain {domain:?} is not a value"
        ))),
    }
}

// ── Type checking ──────────────────────────────────────────────────

fn check(expr: &Expr) -> Result<Ty, CompileError> {
    match expr {
        Expr::Literal(Value::Bool(_)) | Expr::HasAttribute { .. } => Ok(Ty::Bool),
        Expr::Literal(Value::Int(_)) => Ok(Ty::Int),
        Expr::Literal(Value::String(_)) | Expr::Driver => Ok(Ty::String),
        Expr::Attribute { .. } => Ok(Ty::Dyn),
        Expr::Not(inner) => {
            let ty = check(inner)?;
            if !ty.compatible(Ty::Bool) {
                return Err(CompileError::Type(format!(
                    "found no matching overload for '!' applied to '{ty}'"
                )));
            }
            Ok(Ty::Bool)
        }
        Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            let op = if matches!(expr, Expr::And(..)) { "&&" } else { "||" };
            for side in [lhs, rhs] {
                let ty = check(side)?;
                if !ty.compatible(Ty::Bool) {
                    return Err(CompileError::Type(format!(
                        "found no matching overload for '{op}' applied to '{ty}'"
                    )));
                }
            }
            Ok(Ty::Bool)
        }
        Expr::Compare { op, lhs, rhs } => {
            let (l, r) = (check(lhs)?, check(rhs)?);
            let ordered_ok = op.is_equality() || !(l == Ty::Bool || r == Ty::Bool);
            if !l.compatible(r) || !ordered_ok {
                return Err(CompileError::Type(format!(
                    "found no matching overload for '{}' applied to '({l}, {r})'",
                    op.symbol()
                )));
            }
            Ok(Ty::Bool)
        }
    }
}

// ── Evaluation ─────────────────────────────────────────────────────

/// The parts of a device visible to a predicate.
#[derive(Debug, Clone, Copy)]
pub struct DeviceView<'a> {
    pub driver: &'a str,
    pub attributes: &'a BTreeMap<String, AttributeValue>,
}

impl DeviceView<'_> {
    fn lookup(&self, domain: &str, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .get(&format!("{domain}/{name}"))
            .or_else(|| (domain == self.driver).then(|| self.attributes.get(name)).flatten())
    }
}

fn eval(expr: &Expr, device: &DeviceView<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Driver => Ok(Value::String(device.driver.to_string())),
        Expr::Attribute { domain, name } => device
            .lookup(domain, name)
            .map(Value::from)
            .ok_or_else(|| EvalError::NoSuchKey(name.clone())),
        Expr::HasAttribute { domain, name } => {
            Ok(Value::Bool(device.lookup(domain, name).is_some()))
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval_bool(inner, device, "!")?)),
        // Logical operators absorb errors when the other side decides the result.
        Expr::And(lhs, rhs) => {
            let l = eval_bool(lhs, device, "&&");
            if matches!(l, Ok(false)) {
                return Ok(Value::Bool(false));
            }
            let r = eval_bool(rhs, device, "&&");
            match (l, r) {
                (_, Ok(false)) => Ok(Value::Bool(false)),
                (Err(e), _) | (_, Err(e)) => Err(e),
                (Ok(_), Ok(_)) => Ok(Value::Bool(true)),
            }
        }
        Expr::Or(lhs, rhs) => {
            let l = eval_bool(lhs, device, "||");
            if matches!(l, Ok(true)) {
                return Ok(Value::Bool(true));
            }
            let r = eval_bool(rhs, device, "||");
            match (l, r) {
                (_, Ok(true)) => Ok(Value::Bool(true)),
                (Err(e), _) | (_, Err(e)) => Err(e),
                (Ok(_), Ok(_)) => Ok(Value::Bool(false)),
            }
        }
        Expr::Compare { op, lhs, rhs } => {
            let (l, r) = (eval(lhs, device)?, eval(rhs, device)?);
            compare(*op, &l, &r).map(Value::Bool)
        }
    }
}

fn eval_bool(expr: &Expr, device: &DeviceView<'_>, op: &str) -> Result<bool, EvalError> {
    match eval(expr, device)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::NoSuchOverload(format!("{op} applied to {}", other.type_name()))),
    }
}

fn compare(op: CompareOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    let ordering = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) if op.is_equality() => a.cmp(b),
        _ => {
            return Err(EvalError::NoSuchOverload(format!(
                "{} {} {}",
                l.type_name(),
                op.symbol(),
                r.type_name()
            )));
        }
    };
    Ok(match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    })
}

// ── Public API ─────────────────────────────────────────────────────

/// A compiled predicate expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    /// Parse and type-check an expression.
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let tokens = Lexer::new(source).tokenize()?;
        let expr = Parser::new(tokens, source.len()).parse()?;
        let ty = check(&expr)?;
        if !ty.compatible(Ty::Bool) {
            return Err(CompileError::Type(format!(
                "expression must evaluate to bool, got {ty}"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one device.
    pub fn matches(&self, device: &DeviceView<'_>) -> Result<bool, EvalError> {
        match eval(&self.expr, device)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::NotBool(other.type_name())),
        }
    }
}
