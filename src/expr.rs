//! Expression compiler and evaluator for matcher conditions.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Boolean operators: `&&`, `||`, `!`
//! - Arithmetic: `+`, `-`, `*`, `/`, `%`, unary `-`
//! - Membership: `x in list`
//! - Identifiers: `name` or `name.attr` (e.g. `r.sub`, `p.obj`)
//! - Function calls: `g(r.sub, p.sub)`
//! - Literals: integers, floats, `"strings"`, `true`, `false`
//! - Parentheses for grouping
//!
//! Compilation is a separate step from evaluation: a [`CompiledExpr`] carries
//! the set of identifiers the expression reads and the set of functions it
//! calls, which the matcher uses for policy binding and index construction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::errors::EngineError;

// ─── Values ─────────────────────────────────────────────────────────────

/// A runtime value bound to an identifier or produced by evaluation.
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<Value>),
    Null,
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
            Value::Null => "null",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Null, Value::Null) => true,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(_) => Value::Null,
        }
    }
}

/// A callable registered in the evaluation environment, e.g. the role-link
/// predicate `g(...)`.
pub type ExprFunction = Arc<dyn Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync>;

/// Named functions available to an expression during evaluation.
#[derive(Default, Clone)]
pub struct FunctionMap {
    funcs: HashMap<String, ExprFunction>,
}

impl FunctionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, f: ExprFunction) {
        self.funcs.insert(name.to_string(), f);
    }

    pub fn get(&self, name: &str) -> Option<&ExprFunction> {
        self.funcs.get(name)
    }
}

/// Identifier bindings plus functions for one evaluation.
pub struct EvalContext<'a> {
    vars: &'a HashMap<String, Value>,
    funcs: &'a FunctionMap,
}

impl<'a> EvalContext<'a> {
    pub fn new(vars: &'a HashMap<String, Value>, funcs: &'a FunctionMap) -> Self {
        Self { vars, funcs }
    }
}

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryNot(Box<Expr>),
    UnaryNeg(Box<Expr>),
    In {
        element: Box<Expr>,
        collection: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

// ─── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Dot,
    Comma,
    LParen,
    RParen,
    Eq,  // ==
    Ne,  // !=
    Gt,  // >
    Lt,  // <
    Ge,  // >=
    Le,  // <=
    And, // &&
    Or,  // ||
    Not, // !
    In,  // in
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' if i + 1 < chars.len() && chars[i + 1] == '=' => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if i + 1 < chars.len() && chars[i + 1] == '=' => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if i + 1 < chars.len() && chars[i + 1] == '=' => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if i + 1 < chars.len() && chars[i + 1] == '=' => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if i + 1 < chars.len() && chars[i + 1] == '&' => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if i + 1 < chars.len() && chars[i + 1] == '|' => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1; // skip escaped char
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(EngineError::ExprSyntax(
                        "unterminated string literal".into(),
                    ));
                }
                let s: String = chars[start..i].iter().collect();
                tokens.push(Token::Str(s));
                i += 1; // skip closing quote
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                if num_str.contains('.') {
                    let f: f64 = num_str.parse().map_err(|_| {
                        EngineError::ExprSyntax(format!("invalid float `{num_str}`"))
                    })?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = num_str.parse().map_err(|_| {
                        EngineError::ExprSyntax(format!("invalid integer `{num_str}`"))
                    })?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "in" => tokens.push(Token::In),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            c => {
                return Err(EngineError::ExprSyntax(format!("unexpected character `{c}`")));
            }
        }
    }
    Ok(tokens)
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect_rparen(&mut self) -> Result<(), EngineError> {
        if self.advance() != Some(Token::RParen) {
            return Err(EngineError::ExprSyntax(
                "expected closing parenthesis `)`".into(),
            ));
        }
        Ok(())
    }

    /// Entry: parse_or
    fn parse_expr(&mut self) -> Result<Expr, EngineError> {
        self.parse_or()
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::BinOp {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::BinOp {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// comparison = additive (("==" | "!=" | ">" | "<" | ">=" | "<=" | "in") additive)?
    fn parse_comparison(&mut self) -> Result<Expr, EngineError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Le) => BinOp::Le,
            Some(Token::In) => {
                self.advance();
                let right = self.parse_additive()?;
                return Ok(Expr::In {
                    element: Box::new(left),
                    collection: Box::new(right),
                });
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// additive = multiplicative (("+" | "-") multiplicative)*
    fn parse_additive(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    /// multiplicative = unary (("*" | "/" | "%") unary)*
    fn parse_multiplicative(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    /// unary = "!" unary | "-" unary | primary
    fn parse_unary(&mut self) -> Result<Expr, EngineError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::UnaryNot(Box::new(expr)));
        }
        if self.peek() == Some(&Token::Minus) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::UnaryNeg(Box::new(expr)));
        }
        self.parse_primary()
    }

    /// primary = literal | path | call | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, EngineError> {
        match self.peek().cloned() {
            Some(Token::Int(n)) => {
                self.advance();
                Ok(Expr::Literal(Value::Int(n)))
            }
            Some(Token::Float(f)) => {
                self.advance();
                Ok(Expr::Literal(Value::Float(f)))
            }
            Some(Token::Str(s)) => {
                self.advance();
                Ok(Expr::Literal(Value::Str(s)))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Some(Token::Ident(name)) => {
                self.advance();
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect_rparen()?;
                    return Ok(Expr::Call { name, args });
                }
                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        _ => {
                            return Err(EngineError::ExprSyntax(
                                "expected identifier after `.`".into(),
                            ));
                        }
                    }
                }
                Ok(Expr::Path(path))
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            other => Err(EngineError::ExprSyntax(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }
}

// ─── Compilation ────────────────────────────────────────────────────────

/// A parsed expression plus the identifiers it reads and the functions it
/// calls.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    root: Expr,
    free_vars: BTreeSet<String>,
    functions: BTreeSet<String>,
}

impl CompiledExpr {
    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Dotted identifiers the expression reads, e.g. `{"p.obj", "r.obj"}`.
    pub fn free_vars(&self) -> &BTreeSet<String> {
        &self.free_vars
    }

    pub fn functions(&self) -> &BTreeSet<String> {
        &self.functions
    }

    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<Value, EngineError> {
        eval_expr(&self.root, ctx)
    }

    /// Evaluate and require a boolean result.
    pub fn eval_bool(&self, ctx: &EvalContext<'_>) -> Result<bool, EngineError> {
        match self.eval(ctx)? {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::ExprType(format!(
                "matcher must evaluate to a boolean, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Parse an expression string into a [`CompiledExpr`].
pub fn compile(input: &str) -> Result<CompiledExpr, EngineError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(EngineError::ExprSyntax("empty expression".into()));
    }
    let mut parser = Parser::new(tokens);
    let root = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(EngineError::ExprSyntax(format!(
            "unexpected trailing token: {:?}",
            parser.tokens[parser.pos]
        )));
    }

    let mut free_vars = BTreeSet::new();
    let mut functions = BTreeSet::new();
    collect_idents(&root, &mut free_vars, &mut functions);

    Ok(CompiledExpr {
        root,
        free_vars,
        functions,
    })
}

fn collect_idents(expr: &Expr, vars: &mut BTreeSet<String>, funcs: &mut BTreeSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path(segments) => {
            vars.insert(segments.join("."));
        }
        Expr::UnaryNot(inner) | Expr::UnaryNeg(inner) => collect_idents(inner, vars, funcs),
        Expr::BinOp { left, right, .. } => {
            collect_idents(left, vars, funcs);
            collect_idents(right, vars, funcs);
        }
        Expr::In {
            element,
            collection,
        } => {
            collect_idents(element, vars, funcs);
            collect_idents(collection, vars, funcs);
        }
        Expr::Call { name, args } => {
            funcs.insert(name.clone());
            for arg in args {
                collect_idents(arg, vars, funcs);
            }
        }
    }
}

// ─── Evaluator ──────────────────────────────────────────────────────────

fn eval_expr(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value, EngineError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => {
            let name = segments.join(".");
            ctx.vars
                .get(&name)
                .cloned()
                .ok_or(EngineError::ExprUnbound(name))
        }
        Expr::UnaryNot(inner) => match eval_expr(inner, ctx)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(EngineError::ExprType(format!(
                "`!` operator requires a boolean operand, got {}",
                other.type_name()
            ))),
        },
        Expr::UnaryNeg(inner) => match eval_expr(inner, ctx)? {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(EngineError::ExprType(format!(
                "unary `-` requires a numeric operand, got {}",
                other.type_name()
            ))),
        },
        Expr::In {
            element,
            collection,
        } => {
            let elem = eval_expr(element, ctx)?;
            match eval_expr(collection, ctx)? {
                Value::Array(items) => Ok(Value::Bool(items.contains(&elem))),
                other => Err(EngineError::ExprType(format!(
                    "`in` operator requires an array on the right side, got {}",
                    other.type_name()
                ))),
            }
        }
        Expr::Call { name, args } => {
            let f = ctx
                .funcs
                .get(name)
                .ok_or_else(|| EngineError::ExprUnbound(name.clone()))?;
            let mut vals = Vec::with_capacity(args.len());
            for arg in args {
                vals.push(eval_expr(arg, ctx)?);
            }
            f(&vals)
        }
        Expr::BinOp { op, left, right } => match op {
            BinOp::And => match eval_expr(left, ctx)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => require_bool(eval_expr(right, ctx)?, "&&"),
                other => Err(bool_operand_err("&&", &other)),
            },
            BinOp::Or => match eval_expr(left, ctx)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => require_bool(eval_expr(right, ctx)?, "||"),
                other => Err(bool_operand_err("||", &other)),
            },
            BinOp::Eq => {
                let l = eval_expr(left, ctx)?;
                let r = eval_expr(right, ctx)?;
                Ok(Value::Bool(l == r))
            }
            BinOp::Ne => {
                let l = eval_expr(left, ctx)?;
                let r = eval_expr(right, ctx)?;
                Ok(Value::Bool(l != r))
            }
            BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
                let l = eval_expr(left, ctx)?;
                let r = eval_expr(right, ctx)?;
                let lf = numeric_operand(&l)?;
                let rf = numeric_operand(&r)?;
                let result = match op {
                    BinOp::Gt => lf > rf,
                    BinOp::Lt => lf < rf,
                    BinOp::Ge => lf >= rf,
                    BinOp::Le => lf <= rf,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let l = eval_expr(left, ctx)?;
                let r = eval_expr(right, ctx)?;
                eval_arithmetic(*op, &l, &r)
            }
        },
    }
}

fn require_bool(v: Value, op: &str) -> Result<Value, EngineError> {
    match v {
        Value::Bool(_) => Ok(v),
        other => Err(bool_operand_err(op, &other)),
    }
}

fn bool_operand_err(op: &str, v: &Value) -> EngineError {
    EngineError::ExprType(format!(
        "`{op}` requires boolean operands, got {}",
        v.type_name()
    ))
}

fn numeric_operand(v: &Value) -> Result<f64, EngineError> {
    v.as_f64().ok_or_else(|| {
        EngineError::ExprType(format!(
            "comparison operator requires numeric operands, got {}",
            v.type_name()
        ))
    })
}

fn eval_arithmetic(op: BinOp, l: &Value, r: &Value) -> Result<Value, EngineError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        return match op {
            BinOp::Add => Ok(Value::Int(a.wrapping_add(*b))),
            BinOp::Sub => Ok(Value::Int(a.wrapping_sub(*b))),
            BinOp::Mul => Ok(Value::Int(a.wrapping_mul(*b))),
            BinOp::Div => a
                .checked_div(*b)
                .map(Value::Int)
                .ok_or_else(|| EngineError::ExprType("division by zero".into())),
            BinOp::Mod => a
                .checked_rem(*b)
                .map(Value::Int)
                .ok_or_else(|| EngineError::ExprType("division by zero".into())),
            _ => unreachable!(),
        };
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(EngineError::ExprType(format!(
            "arithmetic requires numeric operands, got {} and {}",
            l.type_name(),
            r.type_name()
        )));
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a % b,
        _ => unreachable!(),
    };
    Ok(Value::Float(result))
}
