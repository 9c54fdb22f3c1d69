//! Backend integrations (§4.4–§4.6): IBM MQ and Azure Service Bus, each
//! implementing the shared [`crate::traits::Integration`] contract.

pub mod mq;
pub mod service_bus;

pub use mq::MqIntegration;
pub use service_bus::ServiceBusIntegration;

use crate::error::AsyncMessageError;

/// RFH2 header wrapping is an external concern this crate draws a boundary
/// around (§4.4): a default passthrough, plus an explicit `"rfh2"` codec
/// that fails loudly instead of silently dropping the header request.
pub trait HeaderCodec: Send + Sync {
    fn wrap(&self, payload: &[u8]) -> Result<Vec<u8>, AsyncMessageError>;
}

pub struct NoopHeaderCodec;

impl HeaderCodec for NoopHeaderCodec {
    fn wrap(&self, payload: &[u8]) -> Result<Vec<u8>, AsyncMessageError> {
        Ok(payload.to_vec())
    }
}

pub struct Rfh2HeaderCodec;

impl HeaderCodec for Rfh2HeaderCodec {
    fn wrap(&self, _payload: &[u8]) -> Result<Vec<u8>, AsyncMessageError> {
        Err(AsyncMessageError::Configuration(
            "RFH2 header encoding is not implemented by this daemon".to_string(),
        ))
    }
}

/// Resolves `context.header_type` to a codec. An absent `header_type` is a
/// no-op passthrough; `"rfh2"` is the only other recognized value; anything
/// else is a configuration error on PUT (§4.4: "currently only rfh2 is
/// recognized, anything else is an error on PUT").
pub fn header_codec(header_type: Option<&str>) -> Result<Box<dyn HeaderCodec>, AsyncMessageError> {
    match header_type.map(str::to_lowercase).as_deref() {
        None => Ok(Box::new(NoopHeaderCodec)),
        Some("rfh2") => Ok(Box::new(Rfh2HeaderCodec)),
        Some(other) => Err(AsyncMessageError::Configuration(format!(
            "unsupported header_type \"{other}\""
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_header_type_is_a_passthrough() {
        let codec = header_codec(None).unwrap();
        assert_eq!(codec.wrap(b"hi").unwrap(), b"hi");
    }

    #[test]
    fn rfh2_header_type_is_recognized_but_unimplemented() {
        let err = header_codec(Some("rfh2")).unwrap().wrap(b"hi").unwrap_err();
        assert!(matches!(err, AsyncMessageError::Configuration(_)));
    }

    #[test]
    fn unknown_header_type_is_a_configuration_error() {
        let err = header_codec(Some("mqstr")).unwrap_err();
        assert!(matches!(err, AsyncMessageError::Configuration(_)));
    }
}
