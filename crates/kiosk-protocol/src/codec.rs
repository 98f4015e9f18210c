//! Codec trait and the JSON implementation.
//!
//! A "codec" converts between Rust values and the plaintext bytes that the
//! session layer encrypts. The rest of the stack only depends on the
//! [`Codec`] trait, so a node could swap the body format without touching
//! dispatch code.
//!
//! Packets always go through the [`Envelope`] first:
//!
//! ```text
//! Packet ──to_envelope──▶ Envelope ──encode──▶ bytes
//! bytes  ──decode──▶ Envelope ──from_envelope──▶ Packet
//! ```

use serde::{Serialize, de::DeserializeOwned};

use crate::{Envelope, Packet, ProtocolError};

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because one codec is shared by every
/// per-connection task.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or don't
    /// match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;

    /// Encodes a packet as an envelope.
    fn encode_packet(&self, packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
        self.encode(&packet.to_envelope()?)
    }

    /// Decodes a packet: envelope first, then the packet table lookup, then
    /// the body.
    fn decode_packet(&self, data: &[u8]) -> Result<Packet, ProtocolError> {
        let envelope: Envelope = self.decode(data)?;
        Packet::from_envelope(envelope)
    }
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use kiosk_protocol::{Codec, JsonCodec, Packet, RequestData};
///
/// let codec = JsonCodec;
/// let packet = Packet::RequestData(RequestData { registry_id: "all".into() });
///
/// let bytes = codec.encode_packet(&packet).unwrap();
/// assert_eq!(codec.decode_packet(&bytes).unwrap(), packet);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures;
    use crate::{OrderStatus, OrderUpdated};

    #[test]
    fn test_packet_bytes_are_a_json_envelope() {
        let packet = Packet::OrderUpdated(OrderUpdated {
            order: fixtures::order(9, OrderStatus::Accepted),
        });
        let bytes = JsonCodec.encode_packet(&packet).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["packet_id"], "order_updated_s2c");
        assert_eq!(raw["data"]["order"]["order_id"], 9);
        assert_eq!(JsonCodec.decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_garbage_bytes_are_decode_error() {
        let result = JsonCodec.decode_packet(b"\x00\x01not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_unknown_id_survives_codec() {
        let bytes = br#"{"packet_id":"nope","data":null}"#;
        assert!(matches!(
            JsonCodec.decode_packet(bytes),
            Err(ProtocolError::UnknownPacketId(_))
        ));
    }
}
