//! Key material and the per-direction frame cipher.
//!
//! Three primitives carry the whole session:
//!
//! - **X25519**: the server's static key pair; the client pairs it with an
//!   ephemeral secret to wrap the session key it picked.
//! - **HKDF-SHA256**: every symmetric key is derived, never reused across
//!   purposes: one key to wrap, one to confirm the nonce, one per direction.
//! - **ChaCha20-Poly1305**: all sealing. Frame nonces are
//!   `[ zeros (4) | counter (8, LE) ]`, one counter per direction, so a
//!   frame that is replayed, dropped, or reordered fails to open.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::SessionError;

/// Length of every symmetric key and X25519 key.
pub const KEY_SIZE: usize = 32;

/// Length of the server's handshake nonce.
pub const NONCE_SIZE: usize = 32;

/// Poly1305 tag length.
const TAG_SIZE: usize = 16;

const WRAP_LABEL: &[u8] = b"kiosk v1 wrap";
const CONFIRM_LABEL: &[u8] = b"kiosk v1 confirm";
const CLIENT_TO_SERVER_LABEL: &[u8] = b"kiosk v1 c2s";
const SERVER_TO_CLIENT_LABEL: &[u8] = b"kiosk v1 s2c";

/// Fills a fresh array from the thread-local CSPRNG.
pub(crate) fn random_bytes<const N: usize>() -> [u8; N]
where
    rand::distr::StandardUniform: rand::distr::Distribution<[u8; N]>,
{
    rand::random()
}

// ---------------------------------------------------------------------------
// ServerKeyPair
// ---------------------------------------------------------------------------

/// The server's long-lived X25519 identity.
///
/// One key pair is shared (behind an `Arc`) by every connection the server
/// accepts. The secret zeroizes itself on drop.
pub struct ServerKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ServerKeyPair {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        Self::from_secret_bytes(random_bytes())
    }

    /// Rebuilds a key pair from a stored 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, as sent in `Hello`.
    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Unwraps a session key produced by [`wrap_session_key`].
    pub(crate) fn unwrap_session_key(
        &self,
        wrapped: &[u8],
    ) -> Result<SessionKey, SessionError> {
        if wrapped.len() != KEY_SIZE + KEY_SIZE + TAG_SIZE {
            return Err(SessionError::ProtocolViolation(format!(
                "wrapped session key has {} bytes",
                wrapped.len()
            )));
        }
        let (eph_bytes, sealed) = wrapped.split_at(KEY_SIZE);
        let eph_public = PublicKey::from(to_array(eph_bytes)?);

        let shared = self.secret.diffie_hellman(&eph_public);
        let wrap_key =
            derive(shared.as_bytes(), &wrap_salt(&eph_public, &self.public), WRAP_LABEL)?;

        let mut plain = open_once(&wrap_key, sealed, &[]).map_err(|_| {
            SessionError::ProtocolViolation("session key failed to unwrap".into())
        })?;
        let key = to_array(&plain).map(SessionKey);
        plain.zeroize();
        key
    }
}

impl std::fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SessionKey
// ---------------------------------------------------------------------------

/// The 32-byte secret both ends share once the handshake succeeds.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub(crate) fn generate() -> Self {
        Self(random_bytes())
    }

    /// Seals the server's nonce as proof that we hold this key.
    pub(crate) fn sign_nonce(&self, nonce: &[u8]) -> Result<Vec<u8>, SessionError> {
        let confirm = derive(&self.0, &[], CONFIRM_LABEL)?;
        seal_once(&confirm, nonce, nonce)
    }

    /// Opens a signed nonce, returning the nonce it carried.
    pub(crate) fn open_signed_nonce(
        &self,
        signed: &[u8],
        expected: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let confirm = derive(&self.0, &[], CONFIRM_LABEL)?;
        open_once(&confirm, signed, expected)
    }
}

/// Wraps `session_key` for the holder of `server_public`.
///
/// Output layout: `ephemeral_public (32) ‖ sealed session key (32 + 16)`.
pub(crate) fn wrap_session_key(
    session_key: &SessionKey,
    server_public: &[u8],
) -> Result<Vec<u8>, SessionError> {
    let server_public = PublicKey::from(to_array(server_public)?);
    let ephemeral = StaticSecret::from(random_bytes::<KEY_SIZE>());
    let eph_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&server_public);
    let wrap_key =
        derive(shared.as_bytes(), &wrap_salt(&eph_public, &server_public), WRAP_LABEL)?;

    let mut out = Vec::with_capacity(KEY_SIZE * 2 + TAG_SIZE);
    out.extend_from_slice(eph_public.as_bytes());
    out.extend(seal_once(&wrap_key, &session_key.0, &[])?);
    Ok(out)
}

// ---------------------------------------------------------------------------
// FrameCipher
// ---------------------------------------------------------------------------

/// Seals outgoing frames and opens incoming ones after the handshake.
pub struct FrameCipher {
    sealer: ChaCha20Poly1305,
    opener: ChaCha20Poly1305,
    send_counter: u64,
    recv_counter: u64,
}

impl FrameCipher {
    /// Derives both direction keys from the session key. `is_server`
    /// picks which direction is "send".
    pub(crate) fn new(key: &SessionKey, is_server: bool) -> Result<Self, SessionError> {
        let mut c2s = derive(&key.0, &[], CLIENT_TO_SERVER_LABEL)?;
        let mut s2c = derive(&key.0, &[], SERVER_TO_CLIENT_LABEL)?;
        let (send, recv) = if is_server { (&s2c, &c2s) } else { (&c2s, &s2c) };

        let cipher = Self {
            sealer: ChaCha20Poly1305::new(send.into()),
            opener: ChaCha20Poly1305::new(recv.into()),
            send_counter: 0,
            recv_counter: 0,
        };
        c2s.zeroize();
        s2c.zeroize();
        Ok(cipher)
    }

    /// Seals one frame under the next send nonce.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = frame_nonce(self.send_counter);
        let frame = self
            .sealer
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SessionError::Crypto("frame seal failed"))?;
        self.send_counter = self
            .send_counter
            .checked_add(1)
            .ok_or(SessionError::Crypto("send counter exhausted"))?;
        Ok(frame)
    }

    /// Opens one frame under the next receive nonce.
    ///
    /// The counter only advances on success, but a failure is fatal to
    /// the session anyway.
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, SessionError> {
        if frame.len() < TAG_SIZE {
            return Err(SessionError::ProtocolViolation("frame shorter than tag".into()));
        }
        let nonce = frame_nonce(self.recv_counter);
        let plaintext = self
            .opener
            .decrypt(Nonce::from_slice(&nonce), frame)
            .map_err(|_| {
                SessionError::ProtocolViolation(format!(
                    "frame {} failed authentication",
                    self.recv_counter
                ))
            })?;
        self.recv_counter = self
            .recv_counter
            .checked_add(1)
            .ok_or(SessionError::Crypto("receive counter exhausted"))?;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher")
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compares two byte strings without exiting early on the first mismatch.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn frame_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn wrap_salt(eph_public: &PublicKey, server_public: &PublicKey) -> [u8; KEY_SIZE * 2] {
    let mut salt = [0u8; KEY_SIZE * 2];
    salt[..KEY_SIZE].copy_from_slice(eph_public.as_bytes());
    salt[KEY_SIZE..].copy_from_slice(server_public.as_bytes());
    salt
}

/// HKDF-SHA256 extract-and-expand to one 32-byte key.
fn derive(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE], SessionError> {
    let salt = (!salt.is_empty()).then_some(salt);
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(info, &mut okm)
        .map_err(|_| SessionError::Crypto("key derivation failed"))?;
    Ok(okm)
}

/// Seals with a key that is used for exactly one message, so the
/// all-zero nonce is never repeated under it.
fn seal_once(key: &[u8; KEY_SIZE], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, SessionError> {
    ChaCha20Poly1305::new(key.into())
        .encrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg, aad })
        .map_err(|_| SessionError::Crypto("seal failed"))
}

fn open_once(key: &[u8; KEY_SIZE], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, SessionError> {
    ChaCha20Poly1305::new(key.into())
        .decrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: sealed, aad })
        .map_err(|_| SessionError::ProtocolViolation("sealed value failed authentication".into()))
}

fn to_array(bytes: &[u8]) -> Result<[u8; KEY_SIZE], SessionError> {
    bytes.try_into().map_err(|_| {
        SessionError::ProtocolViolation(format!("expected {KEY_SIZE} bytes, got {}", bytes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_recovers_session_key() {
        let server = ServerKeyPair::generate();
        let key = SessionKey::generate();

        let wrapped = wrap_session_key(&key, &server.public_key()).unwrap();
        assert_eq!(wrapped.len(), 80);

        let unwrapped = server.unwrap_session_key(&wrapped).unwrap();
        assert_eq!(unwrapped.0, key.0);
    }

    #[test]
    fn test_unwrap_with_wrong_server_key_fails() {
        let server = ServerKeyPair::generate();
        let impostor = ServerKeyPair::generate();
        let wrapped = wrap_session_key(&SessionKey::generate(), &server.public_key()).unwrap();

        assert!(matches!(
            impostor.unwrap_session_key(&wrapped),
            Err(SessionError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_public_key_is_stable_for_a_secret() {
        let a = ServerKeyPair::from_secret_bytes([7; KEY_SIZE]);
        let b = ServerKeyPair::from_secret_bytes([7; KEY_SIZE]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_signed_nonce_binds_to_nonce() {
        let key = SessionKey::generate();
        let nonce: [u8; NONCE_SIZE] = random_bytes();
        let signed = key.sign_nonce(&nonce).unwrap();

        assert_eq!(key.open_signed_nonce(&signed, &nonce).unwrap(), nonce);
        let other: [u8; NONCE_SIZE] = random_bytes();
        assert!(key.open_signed_nonce(&signed, &other).is_err());
    }

    #[test]
    fn test_frame_cipher_directions_pair_up() {
        let key = SessionKey::generate();
        let mut client = FrameCipher::new(&key, false).unwrap();
        let mut server = FrameCipher::new(&key, true).unwrap();

        let frame = client.seal(b"request_data").unwrap();
        assert_ne!(&frame[..], b"request_data");
        assert_eq!(server.open(&frame).unwrap(), b"request_data");

        let frame = server.seal(b"response_data").unwrap();
        assert_eq!(client.open(&frame).unwrap(), b"response_data");
    }

    #[test]
    fn test_frame_cipher_rejects_replay() {
        let key = SessionKey::generate();
        let mut client = FrameCipher::new(&key, false).unwrap();
        let mut server = FrameCipher::new(&key, true).unwrap();

        let first = client.seal(b"one").unwrap();
        server.open(&first).unwrap();
        assert!(server.open(&first).is_err());
    }

    #[test]
    fn test_frame_cipher_rejects_own_direction() {
        let key = SessionKey::generate();
        let mut client = FrameCipher::new(&key, false).unwrap();
        let mut other_client = FrameCipher::new(&key, false).unwrap();

        let frame = client.seal(b"loopback").unwrap();
        assert!(other_client.open(&frame).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
