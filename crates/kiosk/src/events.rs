//! Change notifications for the presentation layer.
//!
//! Both node kinds publish what happened on a `tokio::sync::broadcast`
//! channel. Nothing in the sync core waits on subscribers: a slow
//! subscriber lags and loses events, it never stalls a connection.

use kiosk_protocol::Order;
use kiosk_transport::ConnectionId;

/// Capacity of each node's event channel.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// What a [`KioskClient`](crate::KioskClient) reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// TCP connected; handshake starting.
    Connected,
    /// Handshake finished; traffic flows.
    Encrypted,
    /// A full snapshot of one registry was applied.
    RegistrySynced { registry_id: String },
    /// One order was added or replaced.
    OrderUpdated { order_id: i64 },
    /// The link was lost or closed.
    Disconnected,
}

/// What a [`KioskServer`](crate::KioskServer) reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A kiosk finished its handshake.
    PeerEncrypted {
        conn_id: ConnectionId,
        client_id: String,
    },
    /// A connection ended, encrypted or not.
    PeerDisconnected { conn_id: ConnectionId },
    /// The canonical version of one order was stored.
    OrderChanged { order: Order },
    /// A catalog registry changed and was rebroadcast.
    RegistryChanged { registry_id: String },
}
