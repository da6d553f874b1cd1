//! Boolean expressions for CONDITION steps.
//!
//! The grammar is deliberately closed: no function calls, no attribute
//! access beyond dotted lookups into the step's input object.
//!
//! ```text
//! expr    := or
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | cmp
//! cmp     := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := number | string | true | false | null | path | "(" expr ")"
//! path    := ident ("." ident)*
//! ```
//!
//! A bare value in boolean position uses truthiness: `null`, `false`, `0`,
//! `""`, `[]` and `{}` are false.
//!
//! Expressions nest at most [`MAX_DEPTH`] levels, counting parentheses,
//! negations and each extra operand of an `and`/`or` chain.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::EngineError;

pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// A parsed condition, ready to be evaluated against any number of inputs.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, EngineError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(EngineError::Condition("Empty condition".to_string()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(EngineError::Condition(format!(
                "Unexpected token {:?} in '{}'",
                tok, source
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

    /// Evaluate against a JSON object of variables.
    pub fn evaluate(&self, vars: &Value) -> Result<bool, EngineError> {
        Ok(truthy(&eval(&self.expr, vars)?))
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, vars: &Value) -> Result<bool, EngineError> {
    Condition::parse(source)?.evaluate(vars)
}

fn tokenize(src: &str) -> Result<Vec<Token>, EngineError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let tok = match (c, next_is_eq) {
                    ('=', true) => Token::Cmp(CmpOp::Eq),
                    ('!', true) => Token::Cmp(CmpOp::Ne),
                    ('<', true) => Token::Cmp(CmpOp::Le),
                    ('>', true) => Token::Cmp(CmpOp::Ge),
                    ('<', false) => Token::Cmp(CmpOp::Lt),
                    ('>', false) => Token::Cmp(CmpOp::Gt),
                    ('!', false) => Token::Not,
                    _ => {
                        return Err(EngineError::Condition(format!(
                            "Unexpected '=' at position {} (use '==')",
                            i
                        )))
                    }
                };
                i += if next_is_eq { 2 } else { 1 };
                tokens.push(tok);
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(EngineError::Condition(format!(
                        "Unexpected '{}' at position {}",
                        c, i
                    )));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(EngineError::Condition(
                                "Unterminated string literal".to_string(),
                            ))
                        }
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                s.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    EngineError::Condition(format!("Invalid number '{}'", text))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    _ => {
                        if word.ends_with('.') || word.contains("..") {
                            return Err(EngineError::Condition(format!(
                                "Invalid variable path '{}'",
                                word
                            )));
                        }
                        Token::Ident(word)
                    }
                });
            }
            other => {
                return Err(EngineError::Condition(format!(
                    "Unexpected character '{}' at position {}",
                    other, i
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn descend(&mut self) -> Result<(), EngineError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EngineError::Condition(
                "Condition nested too deeply".to_string(),
            ));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, EngineError> {
        let base = self.depth;
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EngineError> {
        let base = self.depth;
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, EngineError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, EngineError> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, EngineError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(path)) => Ok(Expr::Path(
                path.split('.').map(str::to_string).collect(),
            )),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EngineError::Condition("Missing ')'".to_string())),
                }
            }
            Some(tok) => Err(EngineError::Condition(format!("Unexpected token {:?}", tok))),
            None => Err(EngineError::Condition(
                "Unexpected end of condition".to_string(),
            )),
        }
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn eval(expr: &Expr, vars: &Value) -> Result<Value, EngineError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => lookup(vars, path),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, vars)?))),
        Expr::And(l, r) => {
            let left = eval(l, vars)?;
            if !truthy(&left) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, vars)?)))
        }
        Expr::Or(l, r) => {
            let left = eval(l, vars)?;
            if truthy(&left) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, vars)?)))
        }
        Expr::Compare(op, l, r) => {
            let left = eval(l, vars)?;
            let right = eval(r, vars)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn lookup(vars: &Value, path: &[String]) -> Result<Value, EngineError> {
    let mut current = vars;
    for (depth, key) in path.iter().enumerate() {
        current = current.get(key).ok_or_else(|| {
            EngineError::Condition(format!("Unknown variable '{}'", path[..=depth].join(".")))
        })?;
    }
    Ok(current.clone())
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EngineError> {
    if matches!(op, CmpOp::Eq | CmpOp::Ne) {
        let equal = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            _ => left == right,
        };
        return Ok(equal == (op == CmpOp::Eq));
    }

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
    .ok_or_else(|| {
        EngineError::Condition(format!(
            "Cannot compare {} {} {}",
            type_name(left),
            op.symbol(),
            type_name(right)
        ))
    })?;

    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    })
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_comparison() {
        assert!(evaluate("amount > 100", &json!({"amount": 150})).unwrap());
        assert!(!evaluate("amount > 100", &json!({"amount": 50})).unwrap());
        assert!(evaluate("amount >= 50.0", &json!({"amount": 50})).unwrap());
        assert!(evaluate("delta < -1", &json!({"delta": -3})).unwrap());
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let vars = json!({"severity": "high", "count": 3, "flag": false});
        assert!(evaluate("severity == 'high' and count > 2", &vars).unwrap());
        assert!(evaluate("flag or count == 3 && !flag", &vars).unwrap());
        assert!(!evaluate("not (severity == \"high\" or flag)", &vars).unwrap());
        assert!(evaluate("severity != 'low'", &vars).unwrap());
    }

    #[test]
    fn test_nested_lookup_and_truthiness() {
        let vars = json!({"pr": {"labels": ["bug"], "draft": false, "title": ""}});
        assert!(evaluate("pr.labels", &vars).unwrap());
        assert!(!evaluate("pr.draft", &vars).unwrap());
        assert!(!evaluate("pr.title", &vars).unwrap());
        assert!(evaluate("pr.title == ''", &vars).unwrap());
    }

    #[test]
    fn test_unknown_variable_is_an_error() {
        let err = evaluate("missing > 1", &json!({})).unwrap_err();
        assert!(matches!(err, EngineError::Condition(msg) if msg.contains("missing")));

        let err = evaluate("pr.author == 'x'", &json!({"pr": {}})).unwrap_err();
        assert!(matches!(err, EngineError::Condition(msg) if msg.contains("pr.author")));
    }

    #[test]
    fn test_short_circuit_skips_unknown_variable() {
        assert!(!evaluate("false and missing", &json!({})).unwrap());
        assert!(evaluate("true or missing", &json!({})).unwrap());
    }

    #[test]
    fn test_rejects_code_and_bad_syntax() {
        for bad in ["__import__('os')", "a = 1", "(a > 1", "a > ", "a & b", "'open", ""] {
            assert!(
                evaluate(bad, &json!({"a": 2, "b": 1})).is_err(),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let too_deep = [
            format!("{}1{}", "(".repeat(5_000), ")".repeat(5_000)),
            format!("{}true", "not ".repeat(5_000)),
            format!("{}true", "!".repeat(5_000)),
            vec!["a"; 5_000].join(" and "),
            vec!["a"; 5_000].join(" or "),
        ];
        for source in &too_deep {
            let err = Condition::parse(source).unwrap_err();
            assert!(
                matches!(&err, EngineError::Condition(msg) if msg.contains("nested too deeply")),
                "unexpected error: {}",
                err
            );
        }

        let vars = json!({"a": 1});
        let nested = format!("{}a == 1{}", "(".repeat(20), ")".repeat(20));
        assert!(evaluate(&nested, &vars).unwrap());
        assert!(evaluate(&format!("{}a", "not not ".repeat(10)), &vars).unwrap());
        assert!(evaluate(&vec!["a > 0"; 30].join(" and "), &vars).unwrap());
    }

    #[test]
    fn test_ordering_mismatched_types_is_an_error() {
        assert!(evaluate("name > 3", &json!({"name": "x"})).is_err());
        assert!(!evaluate("name == 3", &json!({"name": "x"})).unwrap());
    }
}
