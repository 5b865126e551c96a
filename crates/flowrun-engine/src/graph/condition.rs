//! Router condition expressions.
//!
//! Grammar:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ("==" | "!=" | ">" | ">=" | "<" | "<=" | "contains") primary )?
//! primary := number | string | true | false | null | path | "(" expr ")"
//! ```
//!
//! Paths start at `state.`, `nodes.<id>.` or `output.`; a bare path is
//! looked up in flow state.

use std::collections::BTreeMap;

use serde_json::Value;

use flowrun_core::error::{FlowError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

/// Data a condition can read.
pub struct ConditionScope<'a> {
    pub state: &'a serde_json::Map<String, Value>,
    pub nodes: &'a BTreeMap<String, Value>,
    /// Merged outputs of the router's direct predecessors.
    pub output: &'a Value,
}

/// A parsed router condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source).map_err(|e| invalid(source, &e))?;
        if tokens.is_empty() {
            return Err(invalid(source, "empty expression"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr().map_err(|e| invalid(source, &e))?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(source, "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, scope: &ConditionScope<'_>) -> Value {
        eval(&self.expr, scope)
    }
}

fn invalid(source: &str, message: &str) -> FlowError {
    FlowError::Configuration(format!("invalid router condition '{}': {}", source, message))
}

/// Whether a value counts as true in `&&`, `||` and `!`.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval(expr: &Expr, scope: &ConditionScope<'_>) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(segments) => resolve(segments, scope),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope))),
        Expr::And(l, r) => Value::Bool(truthy(&eval(l, scope)) && truthy(&eval(r, scope))),
        Expr::Or(l, r) => Value::Bool(truthy(&eval(l, scope)) || truthy(&eval(r, scope))),
        Expr::Compare(l, op, r) => Value::Bool(compare(&eval(l, scope), *op, &eval(r, scope))),
    }
}

fn resolve(segments: &[String], scope: &ConditionScope<'_>) -> Value {
    let (root, rest): (Value, &[String]) = match segments[0].as_str() {
        "state" => (Value::Object(scope.state.clone()), &segments[1..]),
        "output" => (scope.output.clone(), &segments[1..]),
        "nodes" if segments.len() > 1 => match scope.nodes.get(&segments[1]) {
            Some(v) => (v.clone(), &segments[2..]),
            None => return Value::Null,
        },
        _ => (Value::Object(scope.state.clone()), segments),
    };

    let mut current = root;
    for segment in rest {
        // Agents often return JSON as text
        if let Value::String(s) = &current {
            match serde_json::from_str::<Value>(s) {
                Ok(parsed) => current = parsed,
                Err(_) => return Value::Null,
            }
        }
        current = match current {
            Value::Object(mut map) => map.remove(segment).unwrap_or(Value::Null),
            Value::Array(mut items) => match segment.parse::<usize>() {
                Ok(i) if i < items.len() => items.swap_remove(i),
                _ => Value::Null,
            },
            _ => Value::Null,
        };
    }
    current
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Contains => match (left, right) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let ordering = match (as_number(left), as_number(right)) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => match (left, right) {
                    (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) if left.is_number() || right.is_number() => l == r,
        _ => left == right,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string".to_string()),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                s.push(*next);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' | '!' | '>' | '<' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => ("==", 2),
                    ('!', Some('=')) => ("!=", 2),
                    ('>', Some('=')) => (">=", 2),
                    ('<', Some('=')) => ("<=", 2),
                    ('&', Some('&')) => ("&&", 2),
                    ('|', Some('|')) => ("||", 2),
                    ('!', _) => ("!", 1),
                    ('>', _) => (">", 1),
                    ('<', _) => ("<", 1),
                    _ => return Err(format!("unexpected '{}'", c)),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::Op("&&")),
                    "or" => tokens.push(Token::Op("||")),
                    "not" => tokens.push(Token::Op("!")),
                    "contains" => tokens.push(Token::Op("contains")),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(format!("unexpected '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn expr(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.and()?;
        while self.peek_op() == Some("||") {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek_op() == Some("&&") {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.peek_op() == Some("!") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> std::result::Result<Expr, String> {
        let left = self.primary()?;
        let op = match self.peek_op() {
            Some("==") => CompareOp::Eq,
            Some("!=") => CompareOp::Ne,
            Some(">") => CompareOp::Gt,
            Some(">=") => CompareOp::Ge,
            Some("<") => CompareOp::Lt,
            Some("<=") => CompareOp::Le,
            Some("contains") => CompareOp::Contains,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.primary()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(word) => Ok(match word.as_str() {
                "true" | "True" => Expr::Literal(Value::Bool(true)),
                "false" | "False" => Expr::Literal(Value::Bool(false)),
                "null" | "None" => Expr::Literal(Value::Null),
                _ => Expr::Path(word.split('.').map(str::to_string).collect()),
            }),
            Token::LParen => {
                let inner = self.expr()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err("missing ')'".to_string()),
                }
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}
