//! Endpoint string grammar shared by both integrations (§6):
//!
//! ```text
//! endpoint := segment ("," " "? segment)*
//! segment  := key ":" value
//! ```
//!
//! Grounded in `grizzly_common.arguments.parse_arguments` / `get_unsupported_arguments`
//! as used from `mq/__init__.py` and `sb.py` (`parse_arguments(endpoint, ':')`).

use std::collections::HashMap;

use crate::error::AsyncMessageError;

/// Split an endpoint string into an ordered key→value map, splitting each
/// comma-separated segment on the first occurrence of `separator`.
pub fn parse_arguments(endpoint: &str, separator: char) -> HashMap<String, String> {
    endpoint
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|segment| {
            let (key, value) = segment.split_once(separator)?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Keys present in `arguments` that are not in `allowed`.
pub fn get_unsupported_arguments(allowed: &[&str], arguments: &HashMap<String, String>) -> Vec<String> {
    arguments
        .keys()
        .filter(|key| !allowed.contains(&key.as_str()))
        .cloned()
        .collect()
}

/// Result of validating an endpoint string against a `queue`/`topic`
/// discipline shared by both integrations' `get_endpoint_arguments`.
#[derive(Debug, Clone)]
pub struct EndpointArguments {
    pub endpoint_type: String,
    pub endpoint: String,
    pub fields: HashMap<String, String>,
}

impl EndpointArguments {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// The endpoint string with any `expression:` argument stripped, used as the
/// cache key for senders/receivers/connections (invariant 4: the expression
/// is per-request, not part of connection identity).
pub fn cache_key(endpoint: &str) -> String {
    let mut fields = parse_arguments(endpoint, ':');
    fields.remove("expression");
    let mut pairs: Vec<_> = fields.into_iter().collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn configuration_error(message: impl Into<String>) -> AsyncMessageError {
    AsyncMessageError::Configuration(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_endpoint() {
        let args = parse_arguments("queue:TEST, expression:$.name", ':');
        assert_eq!(args.get("queue").unwrap(), "TEST");
        assert_eq!(args.get("expression").unwrap(), "$.name");
    }

    #[test]
    fn unsupported_arguments_lists_unknown_keys() {
        let args = parse_arguments("queue:TEST, bogus:1", ':');
        let unsupported = get_unsupported_arguments(&["queue", "expression"], &args);
        assert_eq!(unsupported, vec!["bogus".to_string()]);
    }

    #[test]
    fn cache_key_strips_expression_and_is_order_independent() {
        let a = cache_key("queue:TEST, expression:$.name");
        let b = cache_key("queue:TEST");
        assert_eq!(a, b);
    }
}
