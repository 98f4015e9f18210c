//! Packet ↔ frame conversion for one connection.
//!
//! ```text
//! send:  Packet ─codec─▶ plaintext ─session.seal─▶ frame ─▶ Connection
//! recv:  Connection ─▶ frame ─session.open─▶ plaintext ─codec─▶ Packet
//!                                                  └─ session.check_inbound
//! ```
//!
//! Both directions share the connection's [`Session`], which is owned by a
//! single task, so the frame counters advance in the same order the frames
//! hit the wire.

use kiosk_protocol::{Codec, Packet};
use kiosk_session::Session;
use kiosk_transport::{Connection, TransportError};

use crate::KioskError;

/// Encodes and seals one packet.
pub(crate) fn encode<C: Codec>(
    codec: &C,
    session: &mut Session,
    packet: &Packet,
) -> Result<Vec<u8>, KioskError> {
    let plaintext = codec.encode_packet(packet)?;
    Ok(session.seal(packet.packet_type(), plaintext)?)
}

/// Opens and decodes one frame, then checks the session may accept it.
///
/// A frame that fails to open is a session error (fatal); one that opens
/// but does not decode is a protocol error (drop the frame).
pub(crate) fn decode<C: Codec>(
    codec: &C,
    session: &mut Session,
    frame: &[u8],
) -> Result<Packet, KioskError> {
    let plaintext = session.open(frame)?;
    let packet = codec.decode_packet(&plaintext)?;
    if let Err(e) = session.check_inbound(packet.packet_type()) {
        session.fail();
        return Err(e.into());
    }
    Ok(packet)
}

/// Encodes, seals and sends one packet.
pub(crate) async fn send<C, T>(
    conn: &T,
    codec: &C,
    session: &mut Session,
    packet: &Packet,
) -> Result<(), KioskError>
where
    C: Codec,
    T: Connection<Error = TransportError>,
{
    let frame = encode(codec, session, packet)?;
    conn.send(&frame).await?;
    tracing::debug!(conn_id = %conn.id(), packet_id = packet.id(), "sent packet");
    Ok(())
}

/// Waits for the next frame; a clean close is reported as an error so the
/// handshake code can use `?`.
pub(crate) async fn recv_frame<T>(conn: &T) -> Result<Vec<u8>, KioskError>
where
    T: Connection<Error = TransportError>,
{
    conn.recv()
        .await?
        .ok_or_else(|| TransportError::ConnectionClosed("peer closed the connection".into()).into())
}
