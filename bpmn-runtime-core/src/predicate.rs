//! Constraint evaluation for gateway conditions.
//!
//! The engine treats expressions as opaque strings; `SimplePredicateEvaluator`
//! covers literals, dotted variable paths, comparison and boolean operators.

use crate::types::Variables;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot evaluate '{expression}': {message}")]
pub struct PredicateError {
    pub expression: String,
    pub message: String,
}

pub trait PredicateEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<bool, PredicateError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimplePredicateEvaluator;

impl PredicateEvaluator for SimplePredicateEvaluator {
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<bool, PredicateError> {
        let fail = |message: String| PredicateError {
            expression: expression.to_string(),
            message,
        };
        let tokens = tokenize(expression).map_err(fail)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            variables,
        };
        let value = parser.or().map_err(fail)?;
        if parser.pos != tokens.len() {
            return Err(fail(format!("unexpected token {:?}", tokens[parser.pos])));
        }
        Ok(truthy(&value))
    }
}

// ── Tokens ──

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: [&str; 11] = ["==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "=", "."];

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == '\'' || c == '"' {
            let quote = c;
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && chars[end] != quote {
                end += 1;
            }
            if end >= chars.len() {
                return Err("unterminated string literal".into());
            }
            tokens.push(Token::Str(chars[start..end].iter().collect()));
            i = end + 1;
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number '{text}'"))?;
            tokens.push(Token::Number(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op: &'static str = OPERATORS
                .iter()
                .copied()
                .find(|op| rest.starts_with(*op))
                .ok_or_else(|| format!("unexpected character '{c}'"))?;
            if op == "=" || op == "." {
                return Err(format!("unexpected character '{c}'"));
            }
            tokens.push(Token::Op(op));
            i += op.len();
        }
    }
    Ok(tokens)
}

// ── Parser / evaluator ──

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    variables: &'a Variables,
}

impl Parser<'_> {
    fn peek_op(&self, op: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Op(o)) if *o == op)
    }

    fn or(&mut self) -> Result<Value, String> {
        let mut left = self.and()?;
        while self.peek_op("||") {
            self.pos += 1;
            let right = self.and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, String> {
        let mut left = self.unary()?;
        while self.peek_op("&&") {
            self.pos += 1;
            let right = self.unary()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, String> {
        if self.peek_op("!") {
            self.pos += 1;
            let inner = self.unary()?;
            return Ok(Value::Bool(!truthy(&inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, String> {
        let left = self.primary()?;
        let op = match self.tokens.get(self.pos) {
            Some(Token::Op(op)) if matches!(*op, "==" | "!=" | "<" | "<=" | ">" | ">=") => *op,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.primary()?;
        compare(op, &left, &right).map(Value::Bool)
    }

    fn primary(&mut self) -> Result<Value, String> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Token::Str(s) => Ok(Value::String(s.clone())),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                path => lookup(self.variables, path),
            }),
            Token::LParen => {
                let value = self.or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err("missing ')'".into()),
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// Resolve `a.b.c` against the variables. Missing paths are null.
fn lookup(variables: &Variables, path: &str) -> Value {
    let mut parts = path.split('.');
    let Some(root) = parts.next().and_then(|p| variables.get(p)) else {
        return Value::Null;
    };
    let mut current = root;
    for part in parts {
        let next = match current {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> Result<bool, String> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Ok(match op {
            "==" => l == r,
            "!=" => l != r,
            "<" => l < r,
            "<=" => l <= r,
            ">" => l > r,
            _ => l >= r,
        });
    }
    match op {
        "==" => Ok(left == right),
        "!=" => Ok(left != right),
        _ => match (left, right) {
            (Value::String(l), Value::String(r)) => Ok(match op {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                _ => l >= r,
            }),
            _ => Err(format!("cannot order {left} and {right}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        Variables::from([
            ("amount".to_string(), json!(250)),
            ("approved".to_string(), json!(true)),
            ("customer".to_string(), json!({"tier": "gold", "age": 41})),
            ("name".to_string(), json!("ada")),
        ])
    }

    fn eval(expr: &str) -> Result<bool, PredicateError> {
        SimplePredicateEvaluator.evaluate(expr, &vars())
    }

    #[test]
    fn comparisons_and_paths() {
        assert!(eval("amount > 100").unwrap());
        assert!(!eval("amount <= 100").unwrap());
        assert!(eval("customer.tier == 'gold'").unwrap());
        assert!(eval("customer.age >= 41").unwrap());
        assert!(eval("name != \"bob\"").unwrap());
        assert!(eval("missing == null").unwrap());
    }

    #[test]
    fn boolean_operators_and_grouping() {
        assert!(eval("approved && amount > 100").unwrap());
        assert!(eval("!approved || (amount > 200 && customer.tier == 'gold')").unwrap());
        assert!(!eval("!(approved)").unwrap());
        assert!(eval("approved").unwrap());
    }

    #[test]
    fn malformed_expressions_are_errors() {
        assert!(eval("amount >").is_err());
        assert!(eval("(approved").is_err());
        assert!(eval("amount = 3").is_err());
        assert!(eval("customer < 3").is_err());
        assert!(eval("'open").is_err());
    }
}
