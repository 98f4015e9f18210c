//! Error types for the session layer.

use crate::HandshakeState;

/// Errors raised while establishing or running an encrypted session.
///
/// Every variant is fatal to the session that raised it and to no other:
/// the connection handler closes that one peer and keeps serving the rest.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The peer broke the handshake contract: a nonce that doesn't match,
    /// a handshake packet out of order, or a frame that fails to open.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A non-handshake packet was sent or received before the session
    /// reached `Encrypted`.
    #[error("packet {packet_id} not allowed in state {state}")]
    IllegalState {
        state: HandshakeState,
        packet_id: &'static str,
    },

    /// The peer did not finish the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A cryptographic primitive failed (bad key length, counter
    /// exhausted, AEAD seal failure).
    #[error("crypto failure: {0}")]
    Crypto(&'static str),
}
