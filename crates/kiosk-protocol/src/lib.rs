//! Wire protocol for kiosk sync.
//!
//! This crate defines what the kiosk and the server say to each other:
//!
//! - **Entities** ([`Order`], [`Menu`], [`Category`], [`MenuOption`],
//!   [`OptionGroup`]): the records both sides keep in registries.
//! - **Packets** ([`Packet`], [`PacketType`]): the messages, with their
//!   wire ids and target sides.
//! - **Envelope & codec** ([`Envelope`], [`Codec`], [`JsonCodec`]): how a
//!   packet becomes bytes and back.
//! - **Errors** ([`ProtocolError`]).
//!
//! The protocol layer knows nothing about sockets or encryption; it turns
//! packets into plaintext frames and back.
//!
//! ```text
//! Transport (frames) → Session (decrypt) → Protocol (Packet) → dispatch
//! ```

mod codec;
mod entity;
mod error;
mod packet;

/// Registry ids shared by every node.
pub mod registry_ids {
    /// Reserved id meaning "every registry" in `RequestData`.
    pub const ALL: &str = "all";
    pub const ORDERS: &str = "order";
    pub const MENUS: &str = "menus";
    pub const CATEGORIES: &str = "categories";
    pub const OPTIONS: &str = "options";
    pub const OPTION_GROUPS: &str = "option_groups";
}

pub use codec::{Codec, JsonCodec};
pub use entity::{
    Cart, Category, Entity, EntityKind, Menu, MenuOption, OptionGroup, Order,
    OrderItem, OrderStatus, SelectedOption, SyncEntity,
};
pub use error::ProtocolError;
pub use packet::{
    DataAdded, DataDeleted, EncryptComplete, Envelope, HandShake, Hello,
    KeyExchange, OrderStatusChanged, OrderUpdated, Packet, PacketType,
    RequestData, ResponseData, Side,
};
