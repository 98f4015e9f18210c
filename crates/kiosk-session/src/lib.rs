//! Encrypted sessions for kiosk sync.
//!
//! This crate turns a raw connection into a confidential one:
//!
//! 1. **Handshake**: a four-packet exchange that leaves both ends holding
//!    the same session key ([`Session`], [`HandshakeState`])
//! 2. **Framing**: every later frame sealed with a per-direction key and
//!    counter ([`FrameCipher`])
//! 3. **Peer tracking**: the server's view of who is connected and who may
//!    receive broadcasts ([`PeerTable`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Dispatch (above)  ← only ever sees packets from encrypted sessions
//!     ↕
//! Session (this crate)  ← handshake state, seal/open
//!     ↕
//! Protocol (below)  ← packet types, handshake packet bodies
//! ```

mod crypto;
mod error;
mod peers;
mod session;

pub use crypto::{FrameCipher, KEY_SIZE, NONCE_SIZE, ServerKeyPair};
pub use error::SessionError;
pub use peers::PeerTable;
pub use session::{HandshakeState, Session};
