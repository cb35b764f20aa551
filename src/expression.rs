//! Guard-expression evaluation port.
//!
//! The core treats expressions as opaque strings; only the evaluator behind
//! this port interprets them. [`SimpleExpressionEvaluator`] is the built-in
//! implementation used by fixtures and defaults: dotted-path lookups over
//! flattened bindings, literals, comparison operators, negation, and
//! conjunction. Production guard languages plug in behind the same trait.

use crate::error::ExpressionError;
use serde_json::Value;
use std::collections::BTreeMap;

// ─── Port ─────────────────────────────────────────────────────

/// Result of evaluating one expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: Value,
    /// Evaluator-specific side outputs (e.g. sub-rule results).
    pub raw_outputs: BTreeMap<String, Value>,
}

impl Evaluation {
    pub fn of(value: Value) -> Self {
        Self {
            value,
            raw_outputs: BTreeMap::new(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        truthy(&self.value)
    }
}

/// Shared truthiness: null, `false`, zero, the empty string, and empty
/// arrays are falsy; everything else is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Evaluates guard/rule expressions against a context projection.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against the flattened `bindings`.
    fn evaluate(
        &self,
        expression: &str,
        bindings: &BTreeMap<String, Value>,
    ) -> Result<Evaluation, ExpressionError>;

    /// Syntax-check an expression without bindings. Used by graph
    /// validation before publishing.
    fn dry_parse(&self, expression: &str) -> Result<(), ExpressionError>;
}

// ─── Built-in evaluator ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Path(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    negated: bool,
    lhs: Operand,
    cmp: Option<(Op, Operand)>,
}

/// Built-in evaluator: a conjunction of comparison clauses.
///
/// Grammar (no parentheses): `clause ( "&&" clause )*` where a clause is
/// `[!] operand [op operand]`, operands are dotted paths, quoted strings,
/// numbers, `true`/`false`/`alwaysTrue`/`alwaysFalse`/`null`, and `op` is
/// one of `=`, `!=`, `>`, `>=`, `<`, `<=`. A single bare clause yields the
/// operand's value unchanged, so rule expressions can produce non-boolean
/// outputs.
#[derive(Debug, Default, Clone)]
pub struct SimpleExpressionEvaluator;

impl SimpleExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn parse(expression: &str) -> Result<Vec<Clause>, ExpressionError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ExpressionError::Parse {
                expression: expression.to_string(),
                message: "empty expression".to_string(),
            });
        }
        split_outside_quotes(trimmed, "&&")
            .into_iter()
            .map(|clause| Self::parse_clause(expression, &clause))
            .collect()
    }

    fn parse_clause(expression: &str, clause: &str) -> Result<Clause, ExpressionError> {
        let mut rest = clause.trim();
        let mut negated = false;
        while let Some(stripped) = rest.strip_prefix('!') {
            if stripped.starts_with('=') {
                break;
            }
            negated = !negated;
            rest = stripped.trim_start();
        }

        match find_operator(rest) {
            Some((pos, op, len)) => {
                let lhs = Self::parse_operand(expression, &rest[..pos])?;
                let rhs = Self::parse_operand(expression, &rest[pos + len..])?;
                Ok(Clause {
                    negated,
                    lhs,
                    cmp: Some((op, rhs)),
                })
            }
            None => Ok(Clause {
                negated,
                lhs: Self::parse_operand(expression, rest)?,
                cmp: None,
            }),
        }
    }

    fn parse_operand(expression: &str, raw: &str) -> Result<Operand, ExpressionError> {
        let token = raw.trim();
        if token.is_empty() {
            return Err(ExpressionError::Parse {
                expression: expression.to_string(),
                message: "missing operand".to_string(),
            });
        }

        if let Some(quote) = token.chars().next().filter(|c| *c == '"' || *c == '\'') {
            if token.len() >= 2 && token.ends_with(quote) {
                let inner = &token[1..token.len() - 1];
                return Ok(Operand::Literal(Value::String(inner.to_string())));
            }
            return Err(ExpressionError::Parse {
                expression: expression.to_string(),
                message: "unterminated string literal".to_string(),
            });
        }

        match token {
            "true" | "alwaysTrue" => return Ok(Operand::Literal(Value::Bool(true))),
            "false" | "alwaysFalse" => return Ok(Operand::Literal(Value::Bool(false))),
            "null" => return Ok(Operand::Literal(Value::Null)),
            _ => {}
        }

        if let Ok(n) = token.parse::<i64>() {
            return Ok(Operand::Literal(Value::from(n)));
        }
        if let Ok(f) = token.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Ok(Operand::Literal(Value::Number(n)));
            }
        }

        if token
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            return Ok(Operand::Path(token.to_string()));
        }

        Err(ExpressionError::Parse {
            expression: expression.to_string(),
            message: format!("invalid token `{token}`"),
        })
    }

    fn resolve(
        expression: &str,
        operand: &Operand,
        bindings: &BTreeMap<String, Value>,
    ) -> Result<Value, ExpressionError> {
        match operand {
            Operand::Literal(v) => Ok(v.clone()),
            Operand::Path(path) => bindings.get(path).cloned().ok_or_else(|| {
                ExpressionError::MissingBinding {
                    expression: expression.to_string(),
                    binding: path.clone(),
                }
            }),
        }
    }

    fn compare(
        expression: &str,
        op: Op,
        lhs: &Value,
        rhs: &Value,
    ) -> Result<bool, ExpressionError> {
        match op {
            Op::Eq => Ok(values_equal(lhs, rhs)),
            Op::Ne => Ok(!values_equal(lhs, rhs)),
            Op::Gt | Op::Ge | Op::Lt | Op::Le => {
                let ordering = if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                    a.partial_cmp(&b)
                } else if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
                    Some(a.cmp(b))
                } else {
                    None
                };
                let Some(ordering) = ordering else {
                    return Err(ExpressionError::Type {
                        expression: expression.to_string(),
                        message: format!("cannot order {lhs} against {rhs}"),
                    });
                };
                Ok(match op {
                    Op::Gt => ordering.is_gt(),
                    Op::Ge => ordering.is_ge(),
                    Op::Lt => ordering.is_lt(),
                    Op::Le => ordering.is_le(),
                    Op::Eq | Op::Ne => unreachable!(),
                })
            }
        }
    }
}

impl ExpressionEvaluator for SimpleExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        bindings: &BTreeMap<String, Value>,
    ) -> Result<Evaluation, ExpressionError> {
        let clauses = Self::parse(expression)?;

        // A single bare clause passes the operand value through so rule
        // expressions can yield numbers, strings, or objects.
        if clauses.len() == 1 && !clauses[0].negated && clauses[0].cmp.is_none() {
            let value = Self::resolve(expression, &clauses[0].lhs, bindings)?;
            return Ok(Evaluation::of(value));
        }

        for clause in &clauses {
            let lhs = Self::resolve(expression, &clause.lhs, bindings)?;
            let holds = match &clause.cmp {
                Some((op, rhs_operand)) => {
                    let rhs = Self::resolve(expression, rhs_operand, bindings)?;
                    Self::compare(expression, *op, &lhs, &rhs)?
                }
                None => truthy(&lhs),
            };
            if holds == clause.negated {
                return Ok(Evaluation::of(Value::Bool(false)));
            }
        }
        Ok(Evaluation::of(Value::Bool(true)))
    }

    fn dry_parse(&self, expression: &str) -> Result<(), ExpressionError> {
        Self::parse(expression).map(|_| ())
    }
}

/// Loose equality: numeric compare when both sides are numbers, strict
/// compare for matching types, string-form compare otherwise.
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a == b;
    }
    if std::mem::discriminant(lhs) == std::mem::discriminant(rhs) {
        return lhs == rhs;
    }
    string_form(lhs) == string_form(rhs)
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Split on `separator` occurrences that sit outside quoted literals.
fn split_outside_quotes(input: &str, separator: &str) -> Vec<String> {
    let bytes = input.as_bytes();
    let sep = separator.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                i += 1;
            }
            None => {
                if c == b'"' || c == b'\'' {
                    quote = Some(c);
                    i += 1;
                } else if bytes[i..].starts_with(sep) {
                    parts.push(input[start..i].to_string());
                    i += sep.len();
                    start = i;
                } else {
                    i += 1;
                }
            }
        }
    }
    parts.push(input[start..].to_string());
    parts
}

/// Locate the first comparison operator outside quotes. Returns
/// `(position, op, operator_len)`.
fn find_operator(input: &str) -> Option<(usize, Op, usize)> {
    let bytes = input.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if c == b'"' || c == b'\'' {
            quote = Some(c);
            i += 1;
            continue;
        }
        if !input.is_char_boundary(i) {
            i += 1;
            continue;
        }
        let rest = &input[i..];
        if rest.starts_with("!=") {
            return Some((i, Op::Ne, 2));
        }
        if rest.starts_with(">=") {
            return Some((i, Op::Ge, 2));
        }
        if rest.starts_with("<=") {
            return Some((i, Op::Le, 2));
        }
        if rest.starts_with("==") {
            return Some((i, Op::Eq, 2));
        }
        if c == b'=' {
            return Some((i, Op::Eq, 1));
        }
        if c == b'>' {
            return Some((i, Op::Gt, 1));
        }
        if c == b'<' {
            return Some((i, Op::Lt, 1));
        }
        i += 1;
    }
    None
}
