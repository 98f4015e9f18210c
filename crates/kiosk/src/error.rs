//! Unified error type for kiosk sync.

use kiosk_protocol::ProtocolError;
use kiosk_registry::RegistryError;
use kiosk_session::SessionError;
use kiosk_transport::TransportError;

/// Top-level error that wraps every layer's error.
///
/// The `#[from]` attribute on each variant lets `?` convert layer errors
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum KioskError {
    /// A transport-level error (connect, send, recv, no live channel).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame that could not be turned into a packet, or vice versa.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A handshake or encryption failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A registry rejected an operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl KioskError {
    /// Returns `true` if the error ends the connection it happened on.
    ///
    /// Protocol and registry errors cost one packet; transport and session
    /// errors cost the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Session(_))
    }
}
