//! Pluggable payload serialization.
//!
//! The transport never looks inside a payload. It converts typed messages
//! to a [`serde_json::Value`] tree and hands that tree to a [`PayloadCodec`],
//! which decides the byte representation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};

/// Converts payload trees to and from bytes.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Short name used in logs and handshake metadata.
    fn name(&self) -> &'static str;

    fn encode_value(&self, value: &Value) -> ProtocolResult<Vec<u8>>;

    fn decode_value(&self, bytes: &[u8]) -> ProtocolResult<Value>;
}

/// JSON payload codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_value(&self, value: &Value) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_value(&self, bytes: &[u8]) -> ProtocolResult<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Serializes a typed message through `codec`.
pub fn encode<T>(codec: &dyn PayloadCodec, message: &T) -> ProtocolResult<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(message)?;
    codec.encode_value(&value)
}

/// Deserializes a typed message through `codec`.
pub fn decode<T>(codec: &dyn PayloadCodec, bytes: &[u8]) -> ProtocolResult<T>
where
    T: DeserializeOwned,
{
    let value = codec.decode_value(bytes)?;
    serde_json::from_value(value).map_err(|e| ProtocolError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Operation, ResourceName};

    #[test]
    fn typed_helpers_go_through_the_codec() {
        let op = Operation::IsRegistered {
            resource: ResourceName::parse("test:name=R1").unwrap(),
        };
        let bytes = encode(&JsonCodec, &op).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"op":"is_registered","resource":"test:name=R1"}"#
        );
        let back: Operation = decode(&JsonCodec, &bytes).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = decode::<Operation>(&JsonCodec, b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Codec { .. }));
        let err = decode::<Operation>(&JsonCodec, br#"{"op":"nope"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec { .. }));
    }
}
