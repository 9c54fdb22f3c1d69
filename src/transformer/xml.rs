//! XML transformer backed by `sxd-document`/`sxd-xpath` — the XPath
//! counterpart to the JSON selector dialect, but here the expression
//! language really is the standard one, so there's no case for a hand-rolled
//! evaluator the way §4.8's JSON grammar needed one.

use sxd_document::parser as xml_parser;
use sxd_document::Package;
use sxd_xpath::{Context as XPathContext, Factory, Value as XPathValue};

use super::{Selector, TransformedValue, Transformer, TransformerError};

pub struct XmlTransformer;

impl Transformer for XmlTransformer {
    fn transform(&self, payload: &[u8]) -> Result<TransformedValue, TransformerError> {
        let text = String::from_utf8_lossy(payload).into_owned();
        // Parse eagerly so a malformed document fails at transform time
        // rather than silently surfacing later as an empty selector match.
        xml_parser::parse(&text).map_err(|e| TransformerError::Parse(format!("invalid XML payload: {e}")))?;
        Ok(TransformedValue::Xml(text))
    }

    fn parser(&self, expression: &str) -> Result<Box<dyn Selector>, TransformerError> {
        let factory = Factory::new();
        let compiled = factory
            .build(expression)
            .map_err(|e| TransformerError::Selector(format!("invalid XPath expression \"{expression}\": {e}")))?
            .ok_or_else(|| TransformerError::Selector(format!("empty XPath expression \"{expression}\"")))?;
        Ok(Box::new(XmlSelector { compiled }))
    }
}

struct XmlSelector {
    compiled: sxd_xpath::XPath,
}

impl Selector for XmlSelector {
    fn select(&self, value: &TransformedValue) -> Result<Vec<String>, TransformerError> {
        let TransformedValue::Xml(text) = value else {
            return Err(TransformerError::Selector("XML selector given a non-XML value".into()));
        };

        let package: Package = xml_parser::parse(text).map_err(|e| TransformerError::Parse(e.to_string()))?;
        let document = package.as_document();
        let context = XPathContext::new();

        let result = self
            .compiled
            .evaluate(&context, document.root())
            .map_err(|e| TransformerError::Selector(format!("XPath evaluation failed: {e}")))?;

        Ok(match result {
            XPathValue::Nodeset(nodes) => nodes.iter().map(|n| n.string_value()).collect(),
            XPathValue::String(s) => {
                if s.is_empty() {
                    Vec::new()
                } else {
                    vec![s]
                }
            }
            XPathValue::Number(n) => vec![n.to_string()],
            XPathValue::Boolean(b) => {
                if b {
                    vec![b.to_string()]
                } else {
                    Vec::new()
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_rejects_malformed_xml() {
        let err = XmlTransformer.transform(b"<not-closed>").unwrap_err();
        assert!(matches!(err, TransformerError::Parse(_)));
    }

    #[test]
    fn element_xpath_returns_text_content() {
        let v = XmlTransformer.transform(b"<root><name>test</name></root>").unwrap();
        let selector = XmlTransformer.parser("//name").unwrap();
        assert_eq!(selector.select(&v).unwrap(), vec!["test".to_string()]);
    }

    #[test]
    fn attribute_xpath_returns_attribute_value() {
        let v = XmlTransformer
            .transform(br#"<root><document name="test" id="13"/></root>"#)
            .unwrap();
        let selector = XmlTransformer.parser("//document/@name").unwrap();
        assert_eq!(selector.select(&v).unwrap(), vec!["test".to_string()]);
    }

    #[test]
    fn predicate_xpath_matches_only_qualifying_elements() {
        let v = XmlTransformer
            .transform(br#"<root><document name="test"/><document name="other"/></root>"#)
            .unwrap();
        let selector = XmlTransformer.parser("//document[@name='test']").unwrap();
        assert_eq!(selector.select(&v).unwrap().len(), 1);
    }

    #[test]
    fn non_matching_xpath_returns_empty() {
        let v = XmlTransformer.transform(b"<root><name>test</name></root>").unwrap();
        let selector = XmlTransformer.parser("//missing").unwrap();
        assert!(selector.select(&v).unwrap().is_empty());
    }
}
