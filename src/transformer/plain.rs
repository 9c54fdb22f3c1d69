//! Plain-text transformer: the payload is the value, and the selector
//! expression is an anchored regular expression with at most one capture
//! group (B3) — zero groups means "does it match at all", one group means
//! "return what the group captured".

use regex::Regex;

use super::{Selector, TransformedValue, Transformer, TransformerError};

pub struct PlainTransformer;

impl Transformer for PlainTransformer {
    fn transform(&self, payload: &[u8]) -> Result<TransformedValue, TransformerError> {
        Ok(TransformedValue::Plain(crate::wire::decode_body_lossy(payload)))
    }

    fn parser(&self, expression: &str) -> Result<Box<dyn Selector>, TransformerError> {
        let regex = Regex::new(expression)
            .map_err(|e| TransformerError::Selector(format!("invalid regular expression \"{expression}\": {e}")))?;

        // capture_locations().len() counts the implicit whole-match group 0.
        let group_count = regex.captures_len() - 1;
        if group_count > 1 {
            return Err(TransformerError::Selector(format!(
                "only expressions that have zero or one match group are allowed, got {group_count}"
            )));
        }

        Ok(Box::new(PlainSelector { regex, group_count }))
    }
}

struct PlainSelector {
    regex: Regex,
    group_count: usize,
}

impl Selector for PlainSelector {
    fn select(&self, value: &TransformedValue) -> Result<Vec<String>, TransformerError> {
        let TransformedValue::Plain(text) = value else {
            return Err(TransformerError::Selector("plain selector given a non-plain value".into()));
        };

        let Some(captures) = self.regex.captures(text) else {
            return Ok(Vec::new());
        };

        let matched = if self.group_count == 1 {
            captures.get(1)
        } else {
            captures.get(0)
        };

        Ok(matched.map(|m| m.as_str().to_string()).into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_groups_returns_whole_match() {
        let v = PlainTransformer.transform(b"hello world").unwrap();
        let selector = PlainTransformer.parser("^hello").unwrap();
        assert_eq!(selector.select(&v).unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn one_group_returns_captured_text() {
        let v = PlainTransformer.transform(b"name=test").unwrap();
        let selector = PlainTransformer.parser("^name=(.+)$").unwrap();
        assert_eq!(selector.select(&v).unwrap(), vec!["test".to_string()]);
    }

    #[test]
    fn non_matching_expression_returns_empty() {
        let v = PlainTransformer.transform(b"hello world").unwrap();
        let selector = PlainTransformer.parser("^goodbye").unwrap();
        assert!(selector.select(&v).unwrap().is_empty());
    }

    #[test]
    fn more_than_one_group_is_rejected() {
        let err = PlainTransformer.parser("^(a)(b)$").unwrap_err();
        assert!(matches!(err, TransformerError::Selector(_)));
    }
}
