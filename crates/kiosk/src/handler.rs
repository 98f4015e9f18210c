//! Per-connection handler on the server: handshake, then packet routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Register the peer's outbound queue in the peer table
//!   2. Handshake under a timeout: HandShake → Hello, KeyExchange →
//!      EncryptComplete
//!   3. Mark the peer encrypted so broadcasts reach it
//!   4. Loop: frames from the kiosk → dispatch; packets from the outbound
//!      queue → seal and send
//!
//! The task owns the connection's [`Session`], so sealing and opening
//! never race.

use std::sync::Arc;

use kiosk_protocol::{Packet, Side};
use kiosk_session::{Session, SessionError};
use kiosk_transport::{Connection, ConnectionId, WebSocketConnection};
use tokio::sync::mpsc;

use crate::dispatch::on_server_packet;
use crate::framing;
use crate::server::ServerShared;
use crate::{KioskError, ServerEvent};

/// Drop guard that removes the peer from the table when the handler exits,
/// however it exits.
struct PeerGuard {
    conn_id: ConnectionId,
    shared: Arc<ServerShared>,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.shared.peers.remove(self.conn_id);
        self.shared.emit(ServerEvent::PeerDisconnected {
            conn_id: self.conn_id,
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection(
    conn: WebSocketConnection,
    shared: Arc<ServerShared>,
) -> Result<(), KioskError> {
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let (tx, mut rx) = mpsc::unbounded_channel();
    shared.peers.insert(conn_id, tx);
    let _guard = PeerGuard {
        conn_id,
        shared: Arc::clone(&shared),
    };

    let mut session = Session::server(Arc::clone(&shared.keys));

    // --- Step 1: Handshake ---
    let handshake = tokio::time::timeout(
        shared.config.handshake_timeout,
        perform_handshake(&conn, &shared, &mut session),
    )
    .await;
    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(%conn_id, error = %e, "handshake failed; closing");
            let _ = conn.close().await;
            return Err(e);
        }
        Err(_) => {
            session.fail();
            tracing::warn!(%conn_id, "handshake timed out; closing");
            let _ = conn.close().await;
            return Err(SessionError::HandshakeTimeout.into());
        }
    }

    let client_id = session.client_id().unwrap_or_default().to_string();
    shared.peers.set_client_id(conn_id, &client_id);
    shared.peers.mark_encrypted(conn_id);
    shared.emit(ServerEvent::PeerEncrypted {
        conn_id,
        client_id: client_id.clone(),
    });
    tracing::info!(%conn_id, %client_id, "kiosk encrypted");

    // --- Step 2: Message loop ---
    let result = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break Ok(()),

            outbound = rx.recv() => {
                let Some(packet) = outbound else { break Ok(()) };
                if rx.len() > shared.config.outbound_buffer_warn {
                    tracing::warn!(%conn_id, queued = rx.len(), "outbound queue backing up");
                }
                if let Err(e) = framing::send(&conn, &shared.codec, &mut session, &packet).await {
                    break Err(e);
                }
            }

            frame = conn.recv() => {
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        tracing::info!(%conn_id, %client_id, "kiosk disconnected");
                        break Ok(());
                    }
                    Err(e) => break Err(e.into()),
                };
                if let Err(e) = route_frame(&conn, &shared, &mut session, &frame).await {
                    break Err(e);
                }
            }
        }
    };

    if let Err(e) = &result {
        tracing::warn!(%conn_id, %client_id, error = %e, "closing connection");
    }
    let _ = conn.close().await;
    result
}

/// Runs the server half of the handshake until the session is encrypted.
async fn perform_handshake(
    conn: &WebSocketConnection,
    shared: &ServerShared,
    session: &mut Session,
) -> Result<(), KioskError> {
    let conn_id = conn.id();

    while !session.is_encrypted() {
        let frame = framing::recv_frame(conn).await?;
        let packet = match framing::decode(&shared.codec, session, &frame) {
            Ok(packet) => packet,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(%conn_id, error = %e, "dropping undecodable handshake frame");
                continue;
            }
        };

        let reply = match packet {
            Packet::HandShake(hs) => {
                tracing::debug!(%conn_id, client_id = %hs.client_id, "handshake received");
                Packet::Hello(session.accept_handshake(hs)?)
            }
            Packet::KeyExchange(kx) => {
                Packet::EncryptComplete(session.accept_key_exchange(kx)?)
            }
            other => {
                session.fail();
                return Err(SessionError::ProtocolViolation(format!(
                    "{} during handshake",
                    other.id()
                ))
                .into());
            }
        };
        framing::send(conn, &shared.codec, session, &reply).await?;
    }
    Ok(())
}

/// Decodes one frame from an encrypted kiosk and dispatches it.
///
/// Only fatal errors are returned; a packet that cannot be used is logged
/// and dropped.
async fn route_frame(
    conn: &WebSocketConnection,
    shared: &ServerShared,
    session: &mut Session,
    frame: &[u8],
) -> Result<(), KioskError> {
    let conn_id = conn.id();

    let packet = match framing::decode(&shared.codec, session, frame) {
        Ok(packet) => packet,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::warn!(%conn_id, error = %e, "dropping frame");
            return Ok(());
        }
    };
    tracing::debug!(%conn_id, packet_id = packet.id(), "received packet");

    if !packet.packet_type().is_accepted_by(Side::Server) {
        tracing::warn!(%conn_id, packet_id = packet.id(), "packet not for server; dropped");
        return Ok(());
    }

    let replies = match on_server_packet(shared, conn_id, packet) {
        Ok(replies) => replies,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::warn!(%conn_id, error = %e, "packet dropped");
            return Ok(());
        }
    };
    for reply in &replies {
        framing::send(conn, &shared.codec, session, reply).await?;
    }
    Ok(())
}
