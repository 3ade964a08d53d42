//! Condition Evaluator.
//!
//! `eval(expr?, env) -> bool` and `resolve_template(tmpl, env) -> String`
//! over a pure, dotted-access expression language: attribute access
//! (`Node.field`), equality/comparison, boolean connectives, and
//! membership (`in`). No expression means true. `{{Node.field}}`
//! template variables are rewritten to dotted access before
//! evaluation; `===`/`!==` normalize to `==`/`!=`. On any parse or
//! evaluation error the result is `false` — conditions fail closed,
//! they never panic or propagate an error to the caller.

use std::collections::HashMap;

use serde_json::Value;

/// The evaluation environment: top-level names (built-ins, node
/// attributes, context nodes) mapping to JSON values. Dotted access
/// (`Ctx.x`) indexes into a nested object value.
pub type Env = HashMap<String, Value>;

/// Strips a leading `when ` prefix from an edge label, the convention
/// used by the surface DSL for guard expressions.
pub fn extract_condition(label: Option<&str>) -> Option<String> {
    let label = label?;
    let trimmed = label.trim();
    if let Some(rest) = trimmed.strip_prefix("when ") {
        Some(rest.trim().to_string())
    } else if looks_like_expression(trimmed) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn looks_like_expression(s: &str) -> bool {
    ["==", "!=", "<=", ">=", "<", ">", "&&", "||", " in "]
        .iter()
        .any(|op| s.contains(op))
}

/// `eval(expr?, env) -> bool`. No expression means true.
pub fn eval(expr: Option<&str>, env: &Env) -> bool {
    let Some(expr) = expr else { return true };
    let normalized = normalize(expr);
    match Parser::new(&normalized).parse_full() {
        Ok(ast) => match ast.eval(env) {
            Ok(v) => truthy(&v),
            Err(e) => {
                tracing::warn!(expr = %expr, error = %e, "condition evaluation failed, defaulting to false");
                false
            }
        },
        Err(e) => {
            tracing::warn!(expr = %expr, error = %e, "condition parse failed, defaulting to false");
            false
        }
    }
}

/// Classifies deterministic, side-effect-free expressions — those
/// whose parse consumes the entire input with our grammar. Such edges
/// auto-take when true; expressions that don't parse (free-form,
/// meant for an agent to judge) are not "simple".
pub fn is_simple_condition(expr: &str) -> bool {
    let normalized = normalize(expr);
    Parser::new(&normalized).parse_full().is_ok()
}

/// Rewrites `{{Node.field}}` template variables to their dotted-access
/// value and returns the substituted string. Missing values render as
/// an empty string.
pub fn resolve_template(tmpl: &str, env: &Env) -> String {
    let mut out = String::with_capacity(tmpl.len());
    let mut rest = tmpl;
    loop {
        match rest.find("{{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                match after.find("}}") {
                    None => {
                        out.push_str("{{");
                        out.push_str(after);
                        break;
                    }
                    Some(end) => {
                        let path = after[..end].trim();
                        let value = lookup_path(path, env)
                            .map(value_to_template_string)
                            .unwrap_or_default();
                        out.push_str(&value);
                        rest = &after[end + 2..];
                    }
                }
            }
        }
    }
    out
}

fn value_to_template_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize(expr: &str) -> String {
    expr.replace("===", "==").replace("!==", "!=")
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn lookup_path(path: &str, env: &Env) -> Option<Value> {
    let mut parts = path.split('.');
    let head = parts.next()?;
    let mut current = env.get(head)?.clone();
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

// ---------------------------------------------------------------------
// Minimal recursive-descent parser/evaluator for the expression
// language: `||` < `&&` < `!` (prefix) < comparisons < `in` < primary.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Path(String),
    Literal(Value),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    fn eval(&self, env: &Env) -> Result<Value, String> {
        match self {
            Expr::Path(p) => Ok(lookup_path(p, env).unwrap_or(Value::Null)),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Not(e) => Ok(Value::Bool(!truthy(&e.eval(env)?))),
            Expr::And(a, b) => {
                let av = a.eval(env)?;
                if !truthy(&av) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&b.eval(env)?)))
            }
            Expr::Or(a, b) => {
                let av = a.eval(env)?;
                if truthy(&av) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&b.eval(env)?)))
            }
            Expr::Cmp(op, a, b) => {
                let av = a.eval(env)?;
                let bv = b.eval(env)?;
                Ok(Value::Bool(compare(*op, &av, &bv)))
            }
            Expr::In(a, b) => {
                let av = a.eval(env)?;
                let bv = b.eval(env)?;
                let found = match &bv {
                    Value::Array(items) => items.iter().any(|i| i == &av),
                    Value::String(s) => match &av {
                        Value::String(needle) => s.contains(needle.as_str()),
                        _ => false,
                    },
                    _ => false,
                };
                Ok(Value::Bool(found))
            }
        }
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        _ => {
            let (Some(af), Some(bf)) = (as_f64(a), as_f64(b)) else {
                return false;
            };
            match op {
                CmpOp::Lt => af < bf,
                CmpOp::Le => af <= bf,
                CmpOp::Gt => af > bf,
                CmpOp::Ge => af >= bf,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            }
        }
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_full(&mut self) -> Result<Expr, String> {
        let e = self.parse_or()?;
        self.skip_ws();
        if self.pos != self.input.len() {
            return Err(format!("unexpected trailing input at byte {}", self.pos));
        }
        Ok(e)
    }

    fn skip_ws(&mut self) {
        while self.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn try_consume(&mut self, tok: &str) -> bool {
        self.skip_ws();
        if self.remaining().starts_with(tok) {
            self.pos += tok.len();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        loop {
            if self.try_consume("||") {
                let rhs = self.parse_and()?;
                lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            if self.try_consume("&&") {
                let rhs = self.parse_unary()?;
                lhs = Expr::And(Box::new(lhs), Box::new(rhs));
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        self.skip_ws();
        if self.try_consume("!") {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_primary()?;
        self.skip_ws();
        for (tok, op) in [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            ("<=", CmpOp::Le),
            (">=", CmpOp::Ge),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
        ] {
            if self.try_consume(tok) {
                let rhs = self.parse_primary()?;
                return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
            }
        }
        if self.remaining().starts_with("in ") || self.remaining() == "in" {
            self.pos += 2;
            let rhs = self.parse_primary()?;
            return Ok(Expr::In(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        self.skip_ws();
        if self.try_consume("(") {
            let e = self.parse_or()?;
            self.skip_ws();
            if !self.try_consume(")") {
                return Err("expected closing ')'".to_string());
            }
            return Ok(e);
        }
        if self.try_consume("[") {
            let mut items = Vec::new();
            self.skip_ws();
            if !self.remaining().starts_with(']') {
                loop {
                    let item = self.parse_literal_value()?;
                    items.push(item);
                    self.skip_ws();
                    if self.try_consume(",") {
                        continue;
                    }
                    break;
                }
            }
            self.skip_ws();
            if !self.try_consume("]") {
                return Err("expected closing ']'".to_string());
            }
            return Ok(Expr::Literal(Value::Array(items)));
        }
        if self.remaining().starts_with('"') || self.remaining().starts_with('\'') {
            return Ok(Expr::Literal(self.parse_string()?));
        }
        if self.remaining().starts_with(|c: char| c.is_ascii_digit())
            || self.remaining().starts_with('-')
        {
            return Ok(Expr::Literal(self.parse_number()?));
        }
        let ident = self.parse_ident()?;
        match ident.as_str() {
            "true" => Ok(Expr::Literal(Value::Bool(true))),
            "false" => Ok(Expr::Literal(Value::Bool(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            _ => Ok(Expr::Path(ident)),
        }
    }

    fn parse_literal_value(&mut self) -> Result<Value, String> {
        self.skip_ws();
        if self.remaining().starts_with('"') || self.remaining().starts_with('\'') {
            return self.parse_string();
        }
        self.parse_number()
    }

    fn parse_string(&mut self) -> Result<Value, String> {
        let quote = self.peek().ok_or("unexpected end of input")?;
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                break;
            }
            self.pos += c.len_utf8();
        }
        let s = self.input[start..self.pos].to_string();
        if self.peek() != Some(quote) {
            return Err("unterminated string literal".to_string());
        }
        self.pos += 1;
        Ok(Value::String(s))
    }

    fn parse_number(&mut self) -> Result<Value, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self
            .peek()
            .map(|c| c.is_ascii_digit() || c == '.')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        let slice = &self.input[start..self.pos];
        slice
            .parse::<f64>()
            .map(|n| Value::from(n))
            .map_err(|_| format!("invalid number literal '{slice}'"))
    }

    fn parse_ident(&mut self) -> Result<String, String> {
        let start = self.pos;
        while self
            .peek()
            .map(|c| c.is_alphanumeric() || c == '_' || c == '.')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(format!("expected identifier at byte {start}"));
        }
        Ok(self.input[start..self.pos].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(name: &str, value: Value) -> Env {
        let mut env = Env::new();
        env.insert(name.to_string(), value);
        env
    }

    #[test]
    fn no_expression_is_true() {
        assert!(eval(None, &Env::new()));
    }

    #[test]
    fn equality_over_dotted_access() {
        let mut ctx = serde_json::Map::new();
        ctx.insert("x".into(), Value::from(1));
        let env = env_with("Ctx", Value::Object(ctx));
        assert!(eval(Some("Ctx.x == 1"), &env));
        assert!(!eval(Some("Ctx.x != 1"), &env));
    }

    #[test]
    fn triple_equals_normalizes() {
        let mut ctx = serde_json::Map::new();
        ctx.insert("x".into(), Value::from(1));
        let env = env_with("Ctx", Value::Object(ctx));
        assert!(eval(Some("Ctx.x === 1"), &env));
    }

    #[test]
    fn malformed_expression_fails_closed() {
        assert!(!eval(Some("Ctx.x ==="), &Env::new()));
    }

    #[test]
    fn template_resolution() {
        let mut ctx = serde_json::Map::new();
        ctx.insert("name".into(), Value::String("Ada".into()));
        let env = env_with("Ctx", Value::Object(ctx));
        assert_eq!(resolve_template("hello {{Ctx.name}}!", &env), "hello Ada!");
    }

    #[test]
    fn is_simple_condition_classification() {
        assert!(is_simple_condition("Ctx.x == 1"));
        assert!(!is_simple_condition("please decide what to do"));
    }

    #[test]
    fn membership() {
        let env = env_with("items", Value::Array(vec![Value::from(1), Value::from(2)]));
        assert!(eval(Some("1 in items"), &env));
        assert!(!eval(Some("3 in items"), &env));
    }
}
