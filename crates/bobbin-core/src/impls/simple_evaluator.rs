//! SimpleEvaluator - 最小限の比較式
//!
//! 文法（括弧なし、`&&` は `||` より強く結合）:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := atom ( "&&" atom )*
//! atom    := "true" | "false" | "!" path | path | path op operand
//! op      := "==" | "!=" | "<=" | ">=" | "<" | ">"
//! operand := JSON リテラル | path
//! path    := ident ( "." ident | "." index )*
//! ```
//!
//! 存在しないパスは null として扱う。順序比較は数値同士・文字列同士のみ真になりうる。

use std::cmp::Ordering;

use serde_json::Value;

use crate::domain::errors::EngineError;
use crate::ports::PredicateEvaluator;

/// SimpleEvaluator は組み込みの PredicateEvaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEvaluator;

impl PredicateEvaluator for SimpleEvaluator {
    fn evaluate(&self, expression: &str, facts: &Value) -> Result<bool, EngineError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(error(expression, "empty expression"));
        }
        for disjunct in split_outside_quotes(expression, "||") {
            let mut all = true;
            for atom in split_outside_quotes(disjunct, "&&") {
                if !eval_atom(atom.trim(), facts).map_err(|reason| error(expression, &reason))? {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn error(expression: &str, reason: &str) -> EngineError {
    EngineError::Evaluation {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

const OPERATORS: [&str; 6] = ["==", "!=", "<=", ">=", "<", ">"];

fn eval_atom(atom: &str, facts: &Value) -> Result<bool, String> {
    match atom {
        "" => return Err("empty operand".into()),
        "true" => return Ok(true),
        "false" => return Ok(false),
        _ => {}
    }

    if let Some((pos, op)) = find_operator(atom) {
        let left = atom[..pos].trim();
        let right = atom[pos + op.len()..].trim();
        if left.is_empty() || right.is_empty() {
            return Err(format!("operator {op} needs two operands"));
        }
        let lhs = resolve_path(left, facts)?;
        let rhs = match serde_json::from_str::<Value>(right) {
            Ok(literal) => literal,
            Err(_) => resolve_path(right, facts)?,
        };
        return Ok(compare(op, &lhs, &rhs));
    }

    if let Some(path) = atom.strip_prefix('!') {
        return Ok(!truthy(&resolve_path(path.trim(), facts)?));
    }
    Ok(truthy(&resolve_path(atom, facts)?))
}

/// Leftmost operator outside a string literal. Two-character operators win
/// over their one-character prefixes.
fn find_operator(atom: &str) -> Option<(usize, &'static str)> {
    let bytes = atom.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' if i == 0 || bytes[i - 1] != b'\\' => in_string = !in_string,
            _ if !in_string => {
                let found = OPERATORS
                    .iter()
                    .find(|op| bytes[i..].starts_with(op.as_bytes()));
                if let Some(op) = found {
                    return Some((i, op));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn split_outside_quotes<'a>(s: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut in_string = false;
    let mut start = 0;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' && (i == 0 || bytes[i - 1] != b'\\') {
            in_string = !in_string;
        } else if !in_string && bytes[i..].starts_with(sep.as_bytes()) {
            parts.push(&s[start..i]);
            i += sep.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(&s[start..]);
    parts
}

fn resolve_path(path: &str, facts: &Value) -> Result<Value, String> {
    let valid = |seg: &str| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    };
    let mut current = facts;
    for segment in path.split('.') {
        if !valid(segment) {
            return Err(format!("invalid path `{path}`"));
        }
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
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

fn compare(op: &str, lhs: &Value, rhs: &Value) -> bool {
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        "==" => ordering.map_or(lhs == rhs, |o| o == Ordering::Equal),
        "!=" => ordering.map_or(lhs != rhs, |o| o != Ordering::Equal),
        "<" => ordering == Some(Ordering::Less),
        "<=" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        ">" => ordering == Some(Ordering::Greater),
        ">=" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn facts() -> Value {
        json!({
            "amount": 250,
            "limit": 100.0,
            "customer": {"tier": "gold", "tags": ["vip", "eu"]},
            "approved": false,
            "note": "a || b"
        })
    }

    #[rstest]
    #[case("true", true)]
    #[case("amount > 100", true)]
    #[case("amount <= 100", false)]
    #[case("amount > limit", true)]
    #[case("customer.tier == \"gold\"", true)]
    #[case("customer.tags.0 == \"vip\"", true)]
    #[case("!approved", true)]
    #[case("approved || amount >= 250", true)]
    #[case("approved && amount >= 250", false)]
    #[case("missing == null", true)]
    #[case("missing > 1", false)]
    #[case("note == \"a || b\"", true)]
    #[case("amount == 250.0", true)]
    fn evaluates(#[case] expression: &str, #[case] expected: bool) {
        assert_eq!(
            SimpleEvaluator.evaluate(expression, &facts()).unwrap(),
            expected,
            "{expression}"
        );
    }

    #[rstest]
    #[case("")]
    #[case("amount >")]
    #[case("amount > 1 && ")]
    #[case("a..b")]
    fn malformed_expressions_are_errors(#[case] expression: &str) {
        let err = SimpleEvaluator.evaluate(expression, &facts()).unwrap_err();
        assert!(matches!(err, EngineError::Evaluation { .. }));
    }
}
