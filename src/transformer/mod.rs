//! Content-based message transformers and selectors (§4.8).
//!
//! Each content type exposes a pair: `transform` turns a raw message body
//! into a structured value, `parser` compiles an expression string into a
//! [`Selector`] that can be run against a transformed value to produce zero
//! or more matched strings. A selector returning at least one value is a
//! match (§4.4, §4.6.5).

mod json;
mod plain;
mod xml;

use std::collections::HashMap;
use std::sync::OnceLock;

use thiserror::Error;

pub use json::JsonTransformer;
pub use plain::PlainTransformer;
pub use xml::XmlTransformer;

#[derive(Debug, Error)]
pub enum TransformerError {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Selector(String),
}

/// Content type a transformer is registered under. `Undefined` intentionally
/// has no registered transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformerContentType {
    Json,
    Xml,
    Plain,
    Undefined,
}

impl TransformerContentType {
    pub fn from_str_loose(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "JSON" => Self::Json,
            "XML" => Self::Xml,
            "PLAIN" => Self::Plain,
            _ => Self::Undefined,
        }
    }
}

/// A compiled expression; `select` returns the stringified matched values.
pub trait Selector: Send + Sync {
    fn select(&self, value: &TransformedValue) -> Result<Vec<String>, TransformerError>;
}

/// The structured form a raw payload is transformed into. Kept as an enum
/// rather than a single `serde_json::Value` because XML and plain-text
/// transforms are not naturally JSON trees.
pub enum TransformedValue {
    Json(serde_json::Value),
    Xml(String),
    Plain(String),
}

pub trait Transformer: Send + Sync {
    fn transform(&self, payload: &[u8]) -> Result<TransformedValue, TransformerError>;
    fn parser(&self, expression: &str) -> Result<Box<dyn Selector>, TransformerError>;
}

/// Process-wide transformer registry, mirroring `transformer.available` —
/// built once, never mutated after first access.
pub fn registry() -> &'static HashMap<&'static str, Box<dyn Transformer>> {
    static REGISTRY: OnceLock<HashMap<&'static str, Box<dyn Transformer>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, Box<dyn Transformer>> = HashMap::new();
        map.insert("JSON", Box::new(JsonTransformer));
        map.insert("XML", Box::new(XmlTransformer));
        map.insert("PLAIN", Box::new(PlainTransformer));
        map
    })
}

pub fn lookup(content_type: TransformerContentType) -> Result<&'static dyn Transformer, TransformerError> {
    let key = match content_type {
        TransformerContentType::Json => "JSON",
        TransformerContentType::Xml => "XML",
        TransformerContentType::Plain => "PLAIN",
        TransformerContentType::Undefined => {
            return Err(TransformerError::Parse(
                "no transformer registered for content type UNDEFINED".into(),
            ))
        }
    };
    registry()
        .get(key)
        .map(|boxed| boxed.as_ref())
        .ok_or_else(|| TransformerError::Parse(format!("no transformer registered for {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_loose_is_case_insensitive() {
        assert!(matches!(TransformerContentType::from_str_loose("json"), TransformerContentType::Json));
        assert!(matches!(TransformerContentType::from_str_loose("Json"), TransformerContentType::Json));
        assert!(matches!(TransformerContentType::from_str_loose("nope"), TransformerContentType::Undefined));
    }

    #[test]
    fn undefined_has_no_registered_transformer() {
        assert!(lookup(TransformerContentType::Undefined).is_err());
    }

    #[test]
    fn json_and_xml_and_plain_are_registered() {
        assert!(lookup(TransformerContentType::Json).is_ok());
        assert!(lookup(TransformerContentType::Xml).is_ok());
        assert!(lookup(TransformerContentType::Plain).is_ok());
    }
}
