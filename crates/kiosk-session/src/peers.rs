//! The server's table of connected kiosks.
//!
//! Every accepted connection gets an entry keyed by its [`ConnectionId`].
//! The entry holds the sending half of that connection's outbound queue;
//! the connection's own task owns the socket and the cipher, so anything
//! that wants to talk to a peer goes through this table.
//!
//! # Concurrency note
//!
//! The table has its own lock, separate from every registry lock. The
//! lock is never held across an `.await`: sends go into unbounded
//! channels, which never wait.

use std::collections::BTreeMap;

use kiosk_transport::ConnectionId;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// What the table knows about one connection.
#[derive(Debug)]
struct Peer<M> {
    client_id: Option<String>,
    encrypted: bool,
    tx: mpsc::UnboundedSender<M>,
}

/// Connected peers and their outbound queues.
///
/// `M` is whatever the connection task consumes from its queue.
#[derive(Debug)]
pub struct PeerTable<M> {
    peers: Mutex<BTreeMap<ConnectionId, Peer<M>>>,
}

impl<M> Default for PeerTable<M> {
    fn default() -> Self {
        Self {
            peers: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<M: Clone> PeerTable<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted connection. It is not encrypted yet, so
    /// broadcasts skip it.
    pub fn insert(&self, conn_id: ConnectionId, tx: mpsc::UnboundedSender<M>) {
        self.peers.lock().insert(
            conn_id,
            Peer {
                client_id: None,
                encrypted: false,
                tx,
            },
        );
    }

    /// Records the id the kiosk announced in its `HandShake`.
    pub fn set_client_id(&self, conn_id: ConnectionId, client_id: &str) {
        if let Some(peer) = self.peers.lock().get_mut(&conn_id) {
            peer.client_id = Some(client_id.to_string());
        }
    }

    /// Makes the connection eligible for broadcasts.
    pub fn mark_encrypted(&self, conn_id: ConnectionId) {
        if let Some(peer) = self.peers.lock().get_mut(&conn_id) {
            peer.encrypted = true;
        }
    }

    pub fn remove(&self, conn_id: ConnectionId) {
        self.peers.lock().remove(&conn_id);
    }

    pub fn client_id(&self, conn_id: ConnectionId) -> Option<String> {
        self.peers.lock().get(&conn_id).and_then(|p| p.client_id.clone())
    }

    /// Queues `msg` for one peer. Returns `false` if the peer is gone.
    pub fn send_to(&self, conn_id: ConnectionId, msg: M) -> bool {
        match self.peers.lock().get(&conn_id) {
            Some(peer) => peer.tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Queues `msg` for every encrypted peer except `except`.
    ///
    /// A peer whose task has already exited is skipped and logged; it is
    /// removed when that task finishes its cleanup. Returns the number of
    /// peers the message was queued for.
    pub fn broadcast(&self, msg: &M, except: Option<ConnectionId>) -> usize {
        let peers = self.peers.lock();
        let mut sent = 0;
        for (conn_id, peer) in peers.iter() {
            if !peer.encrypted || Some(*conn_id) == except {
                continue;
            }
            if peer.tx.send(msg.clone()).is_ok() {
                sent += 1;
            } else {
                tracing::debug!(
                    %conn_id,
                    client_id = peer.client_id.as_deref().unwrap_or("?"),
                    "skipping disconnected peer in broadcast"
                );
            }
        }
        sent
    }

    /// Number of connections, encrypted or not.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Number of connections that finished the handshake.
    pub fn encrypted_count(&self) -> usize {
        self.peers.lock().values().filter(|p| p.encrypted).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(id: u64) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_broadcast_skips_unencrypted_and_excluded() {
        let table = PeerTable::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        table.insert(cid(1), tx1);
        table.insert(cid(2), tx2);
        table.insert(cid(3), tx3);
        table.mark_encrypted(cid(1));
        table.mark_encrypted(cid(2));

        let sent = table.broadcast(&"update", Some(cid(2)));

        assert_eq!(sent, 1);
        assert_eq!(rx1.try_recv().unwrap(), "update");
        assert!(rx2.try_recv().is_err());
        assert!(rx3.try_recv().is_err(), "unencrypted peer must be skipped");
    }

    #[test]
    fn test_broadcast_skips_dead_peer() {
        let table = PeerTable::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        table.insert(cid(1), tx1);
        table.insert(cid(2), tx2);
        table.mark_encrypted(cid(1));
        table.mark_encrypted(cid(2));
        drop(rx1);

        assert_eq!(table.broadcast(&7u32, None), 1);
        assert_eq!(rx2.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_client_id_and_removal() {
        let table = PeerTable::<()>::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        table.insert(cid(5), tx);
        assert_eq!(table.client_id(cid(5)), None);

        table.set_client_id(cid(5), "kiosk-5");
        assert_eq!(table.client_id(cid(5)).as_deref(), Some("kiosk-5"));
        assert_eq!(table.encrypted_count(), 0);

        table.remove(cid(5));
        assert!(table.is_empty());
        assert!(!table.send_to(cid(5), ()));
    }
}
