//! JSON transformer and its extended-JSONPath-like selector dialect (§4.8).
//!
//! Not a standards-compliant JSONPath implementation — the expressions this
//! selector accepts (bare equality/range/set-membership against a field
//! reached by dotted or `..` recursive-descent path, plus a
//! `$.`this`[?(@.field=value)]` predicate form) are the non-standard grammar
//! the daemon has always used, so a focused hand-rolled evaluator over
//! `serde_json::Value` is the correct shape here — no published JSONPath
//! crate implements this exact dialect.

use serde_json::Value;

use super::{Selector, TransformedValue, Transformer, TransformerError};

pub struct JsonTransformer;

impl Transformer for JsonTransformer {
    fn transform(&self, payload: &[u8]) -> Result<TransformedValue, TransformerError> {
        let text = String::from_utf8_lossy(payload);
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| TransformerError::Parse(format!("invalid JSON payload: {e}")))?;
        Ok(TransformedValue::Json(value))
    }

    fn parser(&self, expression: &str) -> Result<Box<dyn Selector>, TransformerError> {
        Ok(Box::new(JsonSelector::compile(expression)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
    In,
}

struct JsonSelector {
    /// Field name the expression ultimately compares (the last path segment).
    field: String,
    op: Op,
    /// Comparison operand(s); more than one only for `Op::In`.
    operands: Vec<String>,
}

impl JsonSelector {
    /// Find the top-level comparison operator, scanning left to right and
    /// skipping over quoted substrings and bracketed sub-expressions — the
    /// Rust counterpart of `_get_outer_op`.
    fn compile(expression: &str) -> Result<Self, TransformerError> {
        let expr = expression.trim();

        if let Some((field, operands)) = Self::try_predicate(expr) {
            return Ok(Self {
                field,
                op: Op::Eq,
                operands: vec![operands],
            });
        }

        let (op, op_str) = Self::find_outer_op(expr)
            .ok_or_else(|| TransformerError::Selector(format!("no comparison operator found in expression \"{expr}\"")))?;

        let idx = expr
            .find(op_str)
            .ok_or_else(|| TransformerError::Selector("operator disappeared during split".into()))?;
        let (path, rest) = expr.split_at(idx);
        let value = rest[op_str.len()..].trim();

        let field = Self::last_segment(path);

        let operands = if op == Op::In {
            let inner = value.trim_start_matches('[').trim_end_matches(']');
            inner
                .split(',')
                .map(|s| Self::unquote(s.trim()))
                .collect::<Vec<_>>()
        } else {
            vec![Self::unquote(value)]
        };

        Ok(Self { field, op, operands })
    }

    /// `$.`this`[?(@.field=value)]` style predicate, the single special case
    /// the selector treats separately from a plain comparison.
    fn try_predicate(expr: &str) -> Option<(String, String)> {
        let start = expr.find("[?(@.")?;
        let rest = &expr[start + 5..];
        let end = rest.find(")]")?;
        let predicate = &rest[..end];
        let (field, value) = predicate.split_once(['=', '>', '<'])?;
        Some((field.trim().to_string(), Self::unquote(value.trim())))
    }

    fn find_outer_op(expr: &str) -> Option<(Op, &'static str)> {
        // Longest operators first so `==` is not mistaken for `=`.
        const CANDIDATES: &[(&str, Op)] = &[
            ("|=", Op::In),
            ("==", Op::Eq),
            (">=", Op::Ge),
            ("<=", Op::Le),
            (">", Op::Gt),
            ("<", Op::Lt),
        ];

        let mut depth = 0i32;
        let mut in_quote = false;
        let chars: Vec<char> = expr.chars().collect();

        for i in 0..chars.len() {
            match chars[i] {
                '\'' | '"' => in_quote = !in_quote,
                '[' if !in_quote => depth += 1,
                ']' if !in_quote => depth -= 1,
                _ => {}
            }
            if in_quote || depth != 0 {
                continue;
            }
            for (needle, op) in CANDIDATES {
                if expr[i..].starts_with(needle) {
                    return Some((*op, needle));
                }
            }
        }
        None
    }

    fn last_segment(path: &str) -> String {
        path.trim()
            .trim_start_matches('$')
            .trim_start_matches('.')
            .replace('`', "")
            .rsplit(['.', ']'])
            .find(|s| !s.is_empty())
            .unwrap_or("")
            .trim_start_matches('[')
            .trim_start_matches('?')
            .to_string()
    }

    fn unquote(value: &str) -> String {
        let trimmed = value.trim();
        if (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
            || (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
        {
            trimmed[1..trimmed.len() - 1].to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn matches_scalar(&self, found: &Value) -> bool {
        let found_str = scalar_to_string(found);
        match self.op {
            Op::Eq => found_str.as_deref() == Some(self.operands[0].as_str()),
            Op::In => found_str
                .map(|s| self.operands.iter().any(|o| o == &s))
                .unwrap_or(false),
            Op::Ge | Op::Le | Op::Gt | Op::Lt => {
                let (Some(found_num), Ok(want_num)) = (found.as_f64(), self.operands[0].parse::<f64>()) else {
                    return false;
                };
                match self.op {
                    Op::Ge => found_num >= want_num,
                    Op::Le => found_num <= want_num,
                    Op::Gt => found_num > want_num,
                    Op::Lt => found_num < want_num,
                    _ => unreachable!(),
                }
            }
        }
    }

    /// Recursively collect every value reachable under a key matching
    /// `field`, the behavior `$..field` recursive descent implies.
    fn collect_by_key<'a>(value: &'a Value, field: &str, out: &mut Vec<&'a Value>) {
        match value {
            Value::Object(map) => {
                if let Some(v) = map.get(field) {
                    out.push(v);
                }
                for v in map.values() {
                    Self::collect_by_key(v, field, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    Self::collect_by_key(item, field, out);
                }
            }
            _ => {}
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Selector for JsonSelector {
    fn select(&self, value: &TransformedValue) -> Result<Vec<String>, TransformerError> {
        let TransformedValue::Json(root) = value else {
            return Err(TransformerError::Selector("JSON selector given a non-JSON value".into()));
        };

        let mut found = Vec::new();
        Self::collect_by_key(root, &self.field, &mut found);

        Ok(found
            .into_iter()
            .filter(|v| self.matches_scalar(v))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(payload: &str) -> TransformedValue {
        JsonTransformer.transform(payload.as_bytes()).unwrap()
    }

    #[test]
    fn recursive_descent_equality_matches() {
        let v = transform(r#"{"name":"beta"}"#);
        let selector = JsonTransformer.parser("$..name=='beta'").unwrap();
        assert_eq!(selector.select(&v).unwrap(), vec!["beta".to_string()]);
    }

    #[test]
    fn recursive_descent_equality_does_not_match_other_value() {
        let v = transform(r#"{"name":"alpha"}"#);
        let selector = JsonTransformer.parser("$..name=='beta'").unwrap();
        assert!(selector.select(&v).unwrap().is_empty());
    }

    #[test]
    fn predicate_form_matches_nested_object() {
        let v = transform(r#"{"document":{"name":"test","id":13}}"#);
        let selector = JsonTransformer.parser(r#"$.`this`[?(@.name="test")]"#).unwrap();
        assert_eq!(selector.select(&v).unwrap(), vec!["test".to_string()]);
    }

    #[test]
    fn range_operator_compares_numerically() {
        let v = transform(r#"{"id":13}"#);
        let selector = JsonTransformer.parser("$.id>=10").unwrap();
        assert_eq!(selector.select(&v).unwrap(), vec!["13".to_string()]);
    }

    #[test]
    fn set_membership_matches_any_listed_value() {
        let v = transform(r#"{"name":"mallory"}"#);
        let selector = JsonTransformer.parser("$.name|=[bob,alice,mallory]").unwrap();
        assert_eq!(selector.select(&v).unwrap(), vec!["mallory".to_string()]);
    }
}
