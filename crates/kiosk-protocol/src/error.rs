//! Error types for the protocol layer.
//!
//! A `ProtocolError` always concerns a single frame: the bytes could not be
//! turned into a packet (or a packet into bytes). None of these variants
//! is fatal to a session on its own; receivers log and drop the frame.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a packet into bytes).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed envelope, or a body that does not
    /// match the shape registered for its packet id.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The envelope names a packet id that is not in the packet table.
    #[error("unknown packet id: {0}")]
    UnknownPacketId(String),

    /// The message is well-formed but violates a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
