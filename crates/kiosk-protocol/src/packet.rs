//! Packets, the packet table, and the wire envelope.
//!
//! Every packet type has three fixed properties:
//!
//! - a **packet id**: the stable string carried on the wire (never a Rust
//!   type name, so renaming a struct cannot break old kiosks);
//! - a **body codec**: the serde derive on the packet's struct;
//! - the **target side(s)** that are allowed to receive it.
//!
//! The table lives in [`PacketType::ALL`], a `const` slice, so it is
//! complete before any socket opens. Decoding looks the envelope's
//! `packet_id` up in that table first, which is how an unknown id is told
//! apart from a malformed body.
//!
//! ```text
//! { "packet_id": "request_data", "data": { "registry_id": "menus" } }
//!   └──── PacketType lookup ────┘  └──── body codec ────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::{Entity, Order, ProtocolError};

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Which end of a connection a packet is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// A kiosk terminal.
    Client,
    /// The order-management server.
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

// ---------------------------------------------------------------------------
// Packet bodies
// ---------------------------------------------------------------------------

/// Client → Server, plaintext, first frame after connecting.
/// `client_id` is used for logging and addressing only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandShake {
    pub client_id: String,
}

/// Server → Client: the server's X25519 public key and a one-time nonce
/// the client must prove it sealed under the new session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Client → Server: the wrapped session key and the sealed nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub encrypted_session_key: Vec<u8>,
    pub signed_nonce: Vec<u8>,
}

/// Server → Client, first encrypted frame: the session is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptComplete {
    /// Server wall clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Either direction: "send me a snapshot of `registry_id`" (or `"all"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    pub registry_id: String,
}

/// Either direction: the complete contents of one registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseData {
    pub registry_id: String,
    pub entities: Vec<Entity>,
}

/// Client → Server: add or replace one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAdded {
    pub registry_id: String,
    pub entity: Entity,
}

/// Client → Server: delete one entity by element id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDeleted {
    pub registry_id: String,
    pub entity_id: String,
}

/// Either direction: one order changed (or, with no id yet, was placed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order: Order,
}

/// Server → Client broadcast: the canonical version of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdated {
    pub order: Order,
}

// ---------------------------------------------------------------------------
// PacketType: the packet table
// ---------------------------------------------------------------------------

/// Field-less mirror of [`Packet`], one entry per row of the packet table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    HandShake,
    Hello,
    KeyExchange,
    EncryptComplete,
    RequestData,
    ResponseData,
    DataAdded,
    DataDeleted,
    OrderStatusChanged,
    OrderUpdated,
}

const CLIENT: &[Side] = &[Side::Client];
const SERVER: &[Side] = &[Side::Server];
const BOTH: &[Side] = &[Side::Client, Side::Server];

impl PacketType {
    /// Every packet type, in table order.
    pub const ALL: &'static [PacketType] = &[
        Self::HandShake,
        Self::Hello,
        Self::KeyExchange,
        Self::EncryptComplete,
        Self::RequestData,
        Self::ResponseData,
        Self::DataAdded,
        Self::DataDeleted,
        Self::OrderStatusChanged,
        Self::OrderUpdated,
    ];

    /// The wire identifier.
    pub const fn id(self) -> &'static str {
        match self {
            Self::HandShake => "handshake_c2s",
            Self::Hello => "hello_s2c",
            Self::KeyExchange => "key_c2s",
            Self::EncryptComplete => "encrypt_complete_s2c",
            Self::RequestData => "request_data",
            Self::ResponseData => "response_data",
            Self::DataAdded => "data_added_c2s",
            Self::DataDeleted => "data_deleted_c2s",
            Self::OrderStatusChanged => "order_status_changed",
            Self::OrderUpdated => "order_updated_s2c",
        }
    }

    /// The sides allowed to receive this packet.
    pub const fn targets(self) -> &'static [Side] {
        match self {
            Self::HandShake
            | Self::KeyExchange
            | Self::DataAdded
            | Self::DataDeleted => SERVER,
            Self::Hello | Self::EncryptComplete | Self::OrderUpdated => CLIENT,
            Self::RequestData
            | Self::ResponseData
            | Self::OrderStatusChanged => BOTH,
        }
    }

    /// Returns `true` if `side` may receive this packet.
    pub fn is_accepted_by(self, side: Side) -> bool {
        self.targets().contains(&side)
    }

    /// Returns `true` for the four packets that may travel before the
    /// session is encrypted.
    pub const fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::HandShake
                | Self::Hello
                | Self::KeyExchange
                | Self::EncryptComplete
        )
    }

    /// Looks up a wire identifier in the packet table.
    pub fn from_id(id: &str) -> Option<PacketType> {
        Self::ALL.iter().copied().find(|t| t.id() == id)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// Every packet that can travel between a kiosk and the server.
///
/// Receivers `match` on this enum per side, so adding a variant is a
/// compile error until every dispatcher handles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    HandShake(HandShake),
    Hello(Hello),
    KeyExchange(KeyExchange),
    EncryptComplete(EncryptComplete),
    RequestData(RequestData),
    ResponseData(ResponseData),
    DataAdded(DataAdded),
    DataDeleted(DataDeleted),
    OrderStatusChanged(OrderStatusChanged),
    OrderUpdated(OrderUpdated),
}

impl Packet {
    /// The table row for this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::HandShake(_) => PacketType::HandShake,
            Self::Hello(_) => PacketType::Hello,
            Self::KeyExchange(_) => PacketType::KeyExchange,
            Self::EncryptComplete(_) => PacketType::EncryptComplete,
            Self::RequestData(_) => PacketType::RequestData,
            Self::ResponseData(_) => PacketType::ResponseData,
            Self::DataAdded(_) => PacketType::DataAdded,
            Self::DataDeleted(_) => PacketType::DataDeleted,
            Self::OrderStatusChanged(_) => PacketType::OrderStatusChanged,
            Self::OrderUpdated(_) => PacketType::OrderUpdated,
        }
    }

    /// Shorthand for `packet_type().id()`.
    pub fn id(&self) -> &'static str {
        self.packet_type().id()
    }

    /// Wraps the packet body in an [`Envelope`].
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let data = match self {
            Self::HandShake(p) => serde_json::to_value(p),
            Self::Hello(p) => serde_json::to_value(p),
            Self::KeyExchange(p) => serde_json::to_value(p),
            Self::EncryptComplete(p) => serde_json::to_value(p),
            Self::RequestData(p) => serde_json::to_value(p),
            Self::ResponseData(p) => serde_json::to_value(p),
            Self::DataAdded(p) => serde_json::to_value(p),
            Self::DataDeleted(p) => serde_json::to_value(p),
            Self::OrderStatusChanged(p) => serde_json::to_value(p),
            Self::OrderUpdated(p) => serde_json::to_value(p),
        }
        .map_err(ProtocolError::Encode)?;

        Ok(Envelope {
            packet_id: self.id().to_string(),
            data,
        })
    }

    /// Decodes an envelope using the packet table.
    ///
    /// # Errors
    /// - [`ProtocolError::UnknownPacketId`] if the id is not in the table.
    /// - [`ProtocolError::Decode`] if the body does not match the packet.
    pub fn from_envelope(envelope: Envelope) -> Result<Packet, ProtocolError> {
        let packet_type = PacketType::from_id(&envelope.packet_id)
            .ok_or(ProtocolError::UnknownPacketId(envelope.packet_id))?;
        let data = envelope.data;

        Ok(match packet_type {
            PacketType::HandShake => Self::HandShake(body(data)?),
            PacketType::Hello => Self::Hello(body(data)?),
            PacketType::KeyExchange => Self::KeyExchange(body(data)?),
            PacketType::EncryptComplete => Self::EncryptComplete(body(data)?),
            PacketType::RequestData => Self::RequestData(body(data)?),
            PacketType::ResponseData => Self::ResponseData(body(data)?),
            PacketType::DataAdded => Self::DataAdded(body(data)?),
            PacketType::DataDeleted => Self::DataDeleted(body(data)?),
            PacketType::OrderStatusChanged => {
                Self::OrderStatusChanged(body(data)?)
            }
            PacketType::OrderUpdated => Self::OrderUpdated(body(data)?),
        })
    }
}

fn body<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(ProtocolError::Decode)
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The top-level wire structure: a packet id and the packet body.
///
/// The body stays an untyped JSON value until the packet table says what
/// it should be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub packet_id: String,
    pub data: serde_json::Value,
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::entity::fixtures;
    use crate::OrderStatus;

    #[test]
    fn test_packet_ids_are_unique() {
        let ids: HashSet<&str> =
            PacketType::ALL.iter().map(|t| t.id()).collect();
        assert_eq!(ids.len(), PacketType::ALL.len());
    }

    #[test]
    fn test_from_id_finds_every_table_row() {
        for t in PacketType::ALL {
            assert_eq!(PacketType::from_id(t.id()), Some(*t));
        }
        assert_eq!(PacketType::from_id("fly_to_moon"), None);
    }

    #[test]
    fn test_handshake_packets_flagged() {
        let handshake: Vec<_> = PacketType::ALL
            .iter()
            .filter(|t| t.is_handshake())
            .collect();
        assert_eq!(handshake.len(), 4);
        assert!(!PacketType::RequestData.is_handshake());
    }

    #[test]
    fn test_target_sides() {
        assert!(PacketType::HandShake.is_accepted_by(Side::Server));
        assert!(!PacketType::HandShake.is_accepted_by(Side::Client));
        assert!(PacketType::OrderUpdated.is_accepted_by(Side::Client));
        assert!(!PacketType::OrderUpdated.is_accepted_by(Side::Server));
        assert!(PacketType::OrderStatusChanged.is_accepted_by(Side::Client));
        assert!(PacketType::OrderStatusChanged.is_accepted_by(Side::Server));
    }

    #[test]
    fn test_envelope_json_shape() {
        let packet = Packet::RequestData(RequestData {
            registry_id: "menus".into(),
        });
        let json = serde_json::to_value(packet.to_envelope().unwrap()).unwrap();
        assert_eq!(json["packet_id"], "request_data");
        assert_eq!(json["data"]["registry_id"], "menus");
    }

    #[test]
    fn test_response_data_through_envelope() {
        let packet = Packet::ResponseData(ResponseData {
            registry_id: "order".into(),
            entities: vec![
                fixtures::order(2, OrderStatus::Accepted).into(),
                fixtures::order(1, OrderStatus::Pending).into(),
            ],
        });
        let envelope = packet.to_envelope().unwrap();
        assert_eq!(Packet::from_envelope(envelope).unwrap(), packet);
    }

    #[test]
    fn test_unknown_packet_id_is_distinguished() {
        let envelope = Envelope {
            packet_id: "verify_purchase".into(),
            data: serde_json::json!({}),
        };
        match Packet::from_envelope(envelope) {
            Err(ProtocolError::UnknownPacketId(id)) => {
                assert_eq!(id, "verify_purchase");
            }
            other => panic!("expected UnknownPacketId, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_body_is_decode_error() {
        let envelope = Envelope {
            packet_id: "order_updated_s2c".into(),
            data: serde_json::json!({ "order": "not an order" }),
        };
        assert!(matches!(
            Packet::from_envelope(envelope),
            Err(ProtocolError::Decode(_))
        ));
    }
}
