//! The per-connection handshake state machine.
//!
//! Both ends run a [`Session`]; only the legal transitions differ:
//!
//! ```text
//!  client                                   server
//!  Unencrypted ── HandShake{client_id} ──▶  Unencrypted
//!                                             │ issue nonce
//!  Unencrypted ◀── Hello{pubkey, nonce} ──── HelloSent
//!    │ pick session key, wrap it, sign nonce
//!  KeyExchanged ── KeyExchange{..} ───────▶  HelloSent
//!                                             │ unwrap, verify nonce
//!  KeyExchanged ◀═ EncryptComplete{ts} ════ Encrypted
//!  Encrypted
//! ```
//!
//! `─` frames travel in the clear, `═` frames are sealed. Any failed check
//! moves the session to [`HandshakeState::Failed`], which is terminal.
//!
//! The session only deals in packet types and bytes. Encoding packets is
//! the codec's job; the caller hands the session the plaintext.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use kiosk_protocol::{
    EncryptComplete, HandShake, Hello, KeyExchange, PacketType, Side,
};

use crate::crypto::{
    self, FrameCipher, NONCE_SIZE, ServerKeyPair, SessionKey,
};
use crate::SessionError;

// ---------------------------------------------------------------------------
// HandshakeState
// ---------------------------------------------------------------------------

/// Where a session is in the handshake.
///
/// Ordered: a state compares greater than every state it can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeState {
    /// Connected, nothing exchanged yet.
    Unencrypted,
    /// Server only: `Hello` sent, waiting for `KeyExchange`.
    HelloSent,
    /// Client only: `KeyExchange` sent, waiting for `EncryptComplete`.
    KeyExchanged,
    /// Handshake done; general traffic allowed.
    Encrypted,
    /// A check failed. The connection must be closed.
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unencrypted => "unencrypted",
            Self::HelloSent => "hello_sent",
            Self::KeyExchanged => "key_exchanged",
            Self::Encrypted => "encrypted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Packets that are never sealed, even once a cipher is installed.
fn travels_in_clear(packet_type: PacketType) -> bool {
    matches!(
        packet_type,
        PacketType::HandShake | PacketType::Hello | PacketType::KeyExchange
    )
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One end of one connection's handshake and encryption.
pub struct Session {
    side: Side,
    state: HandshakeState,
    client_id: Option<String>,
    /// Server only: issued in `Hello`, consumed by `KeyExchange`.
    nonce: Option<[u8; NONCE_SIZE]>,
    /// Server only.
    keys: Option<Arc<ServerKeyPair>>,
    cipher: Option<FrameCipher>,
}

impl Session {
    /// A kiosk-side session that will identify itself as `client_id`.
    pub fn client(client_id: impl Into<String>) -> Self {
        Self {
            side: Side::Client,
            state: HandshakeState::Unencrypted,
            client_id: Some(client_id.into()),
            nonce: None,
            keys: None,
            cipher: None,
        }
    }

    /// A server-side session answering with `keys`.
    pub fn server(keys: Arc<ServerKeyPair>) -> Self {
        Self {
            side: Side::Server,
            state: HandshakeState::Unencrypted,
            client_id: None,
            nonce: None,
            keys: Some(keys),
            cipher: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The kiosk's id. On the server it is known once `HandShake` arrives.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.state == HandshakeState::Encrypted
    }

    /// Marks the session failed. Used when the handshake times out or the
    /// caller gives up for its own reasons.
    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
        self.nonce = None;
        self.cipher = None;
    }

    // -- Handshake steps ---------------------------------------------------

    /// Client: the opening packet.
    pub fn begin(&self) -> Result<HandShake, SessionError> {
        self.expect(Side::Client, HandshakeState::Unencrypted, PacketType::HandShake)?;
        Ok(HandShake {
            client_id: self.client_id.clone().unwrap_or_default(),
        })
    }

    /// Server: records the kiosk's id and issues a fresh nonce.
    pub fn accept_handshake(&mut self, packet: HandShake) -> Result<Hello, SessionError> {
        self.guard(|s| {
            s.expect(Side::Server, HandshakeState::Unencrypted, PacketType::HandShake)?;
            let keys = s.keys.as_ref().ok_or(SessionError::Crypto("server key pair missing"))?;
            let public_key = keys.public_key().to_vec();

            let nonce: [u8; NONCE_SIZE] = crypto::random_bytes();
            s.nonce = Some(nonce);
            s.client_id = Some(packet.client_id);
            s.state = HandshakeState::HelloSent;

            Ok(Hello {
                public_key,
                nonce: nonce.to_vec(),
            })
        })
    }

    /// Client: picks the session key, wraps it for the server, signs the
    /// nonce, and installs the frame cipher.
    pub fn accept_hello(&mut self, packet: Hello) -> Result<KeyExchange, SessionError> {
        self.guard(|s| {
            s.expect(Side::Client, HandshakeState::Unencrypted, PacketType::Hello)?;
            if packet.nonce.len() != NONCE_SIZE {
                return Err(SessionError::ProtocolViolation(format!(
                    "hello nonce has {} bytes",
                    packet.nonce.len()
                )));
            }

            let session_key = SessionKey::generate();
            let encrypted_session_key =
                crypto::wrap_session_key(&session_key, &packet.public_key)?;
            let signed_nonce = session_key.sign_nonce(&packet.nonce)?;

            s.cipher = Some(FrameCipher::new(&session_key, false)?);
            s.state = HandshakeState::KeyExchanged;

            Ok(KeyExchange {
                encrypted_session_key,
                signed_nonce,
            })
        })
    }

    /// Server: unwraps the session key and checks the signed nonce. The
    /// nonce is consumed whether or not the check passes.
    pub fn accept_key_exchange(
        &mut self,
        packet: KeyExchange,
    ) -> Result<EncryptComplete, SessionError> {
        self.guard(|s| {
            s.expect(Side::Server, HandshakeState::HelloSent, PacketType::KeyExchange)?;
            let issued = s
                .nonce
                .take()
                .ok_or_else(|| SessionError::ProtocolViolation("no nonce issued".into()))?;
            let keys = s.keys.as_ref().ok_or(SessionError::Crypto("server key pair missing"))?;

            let session_key = keys.unwrap_session_key(&packet.encrypted_session_key)?;
            let returned = session_key.open_signed_nonce(&packet.signed_nonce, &issued)?;
            if !crypto::constant_time_eq(&returned, &issued) {
                return Err(SessionError::ProtocolViolation("nonce mismatch".into()));
            }

            s.cipher = Some(FrameCipher::new(&session_key, true)?);
            s.state = HandshakeState::Encrypted;

            Ok(EncryptComplete {
                timestamp: now_millis(),
            })
        })
    }

    /// Client: the server confirmed; the session is live.
    pub fn accept_encrypt_complete(
        &mut self,
        _packet: &EncryptComplete,
    ) -> Result<(), SessionError> {
        self.guard(|s| {
            s.expect(Side::Client, HandshakeState::KeyExchanged, PacketType::EncryptComplete)?;
            s.state = HandshakeState::Encrypted;
            Ok(())
        })
    }

    // -- Framing -----------------------------------------------------------

    /// Checks that an inbound packet of this type may be processed now.
    pub fn check_inbound(&self, packet_type: PacketType) -> Result<(), SessionError> {
        self.check_allowed(packet_type)
    }

    /// Turns an encoded packet into a wire frame: sealed once a cipher is
    /// installed, except for the clear-text handshake packets.
    pub fn seal(
        &mut self,
        packet_type: PacketType,
        plaintext: Vec<u8>,
    ) -> Result<Vec<u8>, SessionError> {
        self.check_allowed(packet_type)?;
        match self.cipher.as_mut() {
            Some(cipher) if !travels_in_clear(packet_type) => cipher.seal(&plaintext),
            _ => Ok(plaintext),
        }
    }

    /// Turns a wire frame back into the encoded packet. Frames are
    /// expected sealed from the moment this side installs its cipher.
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, SessionError> {
        if self.state == HandshakeState::Failed {
            return Err(SessionError::ProtocolViolation("session already failed".into()));
        }
        let result = match self.cipher.as_mut() {
            Some(cipher) => cipher.open(frame),
            None => Ok(frame.to_vec()),
        };
        if result.is_err() {
            self.fail();
        }
        result
    }

    // -- Internals ---------------------------------------------------------

    fn check_allowed(&self, packet_type: PacketType) -> Result<(), SessionError> {
        if self.state == HandshakeState::Failed
            || (!self.is_encrypted() && !packet_type.is_handshake())
        {
            return Err(SessionError::IllegalState {
                state: self.state,
                packet_id: packet_type.id(),
            });
        }
        Ok(())
    }

    fn expect(
        &self,
        side: Side,
        state: HandshakeState,
        packet_type: PacketType,
    ) -> Result<(), SessionError> {
        if self.side != side || self.state != state {
            return Err(SessionError::ProtocolViolation(format!(
                "{packet_type} on {} side in state {}",
                self.side, self.state
            )));
        }
        Ok(())
    }

    /// Runs one handshake step; any error leaves the session `Failed`.
    fn guard<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let result = step(self);
        if result.is_err() {
            self.fail();
        }
        result
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("side", &self.side)
            .field("state", &self.state)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Session, Session) {
        let keys = Arc::new(ServerKeyPair::generate());
        (Session::client("kiosk-1"), Session::server(keys))
    }

    /// Runs the three key-exchange messages and the confirmation.
    fn handshake(client: &mut Session, server: &mut Session) {
        let hs = client.begin().unwrap();
        let hello = server.accept_handshake(hs).unwrap();
        let kx = client.accept_hello(hello).unwrap();
        let done = server.accept_key_exchange(kx).unwrap();
        client.accept_encrypt_complete(&done).unwrap();
    }

    #[test]
    fn test_handshake_converges_to_encrypted() {
        let (mut client, mut server) = pair();

        let hello = server.accept_handshake(client.begin().unwrap()).unwrap();
        assert_eq!(server.state(), HandshakeState::HelloSent);
        assert_eq!(server.client_id(), Some("kiosk-1"));
        assert_eq!(hello.nonce.len(), NONCE_SIZE);

        let kx = client.accept_hello(hello).unwrap();
        assert_eq!(client.state(), HandshakeState::KeyExchanged);

        let done = server.accept_key_exchange(kx).unwrap();
        assert!(server.is_encrypted());
        assert!(done.timestamp > 0);

        client.accept_encrypt_complete(&done).unwrap();
        assert!(client.is_encrypted());
    }

    #[test]
    fn test_frames_are_sealed_after_handshake() {
        let (mut client, mut server) = pair();
        handshake(&mut client, &mut server);

        let frame = client.seal(PacketType::RequestData, b"{}".to_vec()).unwrap();
        assert_ne!(frame, b"{}");
        assert_eq!(server.open(&frame).unwrap(), b"{}");

        let frame = server.seal(PacketType::ResponseData, b"[]".to_vec()).unwrap();
        assert_eq!(client.open(&frame).unwrap(), b"[]");
    }

    #[test]
    fn test_encrypt_complete_is_first_sealed_frame() {
        let (mut client, mut server) = pair();
        let hello = server.accept_handshake(client.begin().unwrap()).unwrap();

        // Hello travels in the clear.
        let frame = server.seal(PacketType::Hello, b"hello".to_vec()).unwrap();
        assert_eq!(client.open(&frame).unwrap(), b"hello");

        let kx = client.accept_hello(hello).unwrap();
        // KeyExchange is clear even though the client cipher exists now.
        let frame = client.seal(PacketType::KeyExchange, b"kx".to_vec()).unwrap();
        assert_eq!(server.open(&frame).unwrap(), b"kx");

        server.accept_key_exchange(kx).unwrap();
        let frame = server.seal(PacketType::EncryptComplete, b"done".to_vec()).unwrap();
        assert_ne!(frame, b"done");
        assert_eq!(client.open(&frame).unwrap(), b"done");
    }

    #[test]
    fn test_tampered_signed_nonce_is_violation() {
        let (mut client, mut server) = pair();
        let hello = server.accept_handshake(client.begin().unwrap()).unwrap();
        let mut kx = client.accept_hello(hello).unwrap();
        kx.signed_nonce[0] ^= 0xff;

        let result = server.accept_key_exchange(kx);
        assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_nonce_signed_for_another_session_is_rejected() {
        let keys = Arc::new(ServerKeyPair::generate());
        let mut server_a = Session::server(Arc::clone(&keys));
        let mut server_b = Session::server(keys);
        let mut client = Session::client("kiosk-1");

        let hello_a = server_a.accept_handshake(client.begin().unwrap()).unwrap();
        server_b
            .accept_handshake(HandShake { client_id: "kiosk-1".into() })
            .unwrap();

        // A key exchange answering server A's nonce replayed to server B.
        let kx = client.accept_hello(hello_a).unwrap();
        assert!(matches!(
            server_b.accept_key_exchange(kx),
            Err(SessionError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_nonce_is_consumed() {
        let (mut client, mut server) = pair();
        let hello = server.accept_handshake(client.begin().unwrap()).unwrap();
        let kx = client.accept_hello(hello).unwrap();
        server.accept_key_exchange(kx.clone()).unwrap();

        assert!(server.accept_key_exchange(kx).is_err());
    }

    #[test]
    fn test_general_packet_before_encrypted_is_illegal() {
        let (mut client, server) = pair();

        match client.seal(PacketType::RequestData, Vec::new()) {
            Err(SessionError::IllegalState { state, packet_id }) => {
                assert_eq!(state, HandshakeState::Unencrypted);
                assert_eq!(packet_id, "request_data");
            }
            other => panic!("expected IllegalState, got {other:?}"),
        }
        assert!(matches!(
            server.check_inbound(PacketType::OrderStatusChanged),
            Err(SessionError::IllegalState { .. })
        ));
        assert!(server.check_inbound(PacketType::HandShake).is_ok());
    }

    #[test]
    fn test_handshake_out_of_order_fails_session() {
        let (_, mut server) = pair();
        let kx = KeyExchange {
            encrypted_session_key: vec![0; 80],
            signed_nonce: vec![0; 48],
        };
        assert!(server.accept_key_exchange(kx).is_err());
        assert_eq!(server.state(), HandshakeState::Failed);

        // Failed is terminal.
        assert!(server
            .accept_handshake(HandShake { client_id: "late".into() })
            .is_err());
    }

    #[test]
    fn test_client_rejects_short_nonce() {
        let (mut client, _) = pair();
        let hello = Hello {
            public_key: vec![9; 32],
            nonce: vec![1, 2, 3],
        };
        assert!(client.accept_hello(hello).is_err());
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_garbage_frame_after_encrypted_fails_session() {
        let (mut client, mut server) = pair();
        handshake(&mut client, &mut server);

        assert!(server.open(b"definitely not sealed by the client").is_err());
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_state_ordering() {
        assert!(HandshakeState::Unencrypted < HandshakeState::HelloSent);
        assert!(HandshakeState::KeyExchanged < HandshakeState::Encrypted);
        assert_eq!(HandshakeState::HelloSent.to_string(), "hello_sent");
    }
}
