//! # Kiosk
//!
//! Synchronization core for self-order kiosks and the order server they
//! report to.
//!
//! Every node keeps the same registries (orders, menus, categories,
//! options, option groups). Kiosks connect to the server over WebSocket,
//! run a short X25519 handshake, and from then on exchange sealed JSON
//! packets that keep those registries in step.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kiosk::prelude::*;
//!
//! # async fn demo() -> Result<(), KioskError> {
//! let server = KioskServer::builder()
//!     .bind("0.0.0.0:9000")
//!     .build()
//!     .await?;
//! let handle = server.handle();
//! tokio::spawn(server.run());
//!
//! let client = KioskClient::start(
//!     ClientConfig::new("127.0.0.1", 9000, "kiosk-1"),
//!     Arc::new(RegistryManager::standard()),
//! );
//! // ...
//! client.shutdown().await;
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod dispatch;
mod error;
mod events;
mod framing;
mod handler;
mod server;

pub use client::{KioskClient, PendingSend};
pub use config::{ClientConfig, ServerConfig};
pub use error::KioskError;
pub use events::{ClientEvent, ServerEvent};
pub use server::{KioskServer, KioskServerBuilder, ServerHandle};

pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        ClientConfig, ClientEvent, KioskClient, KioskError, KioskServer, KioskServerBuilder,
        PendingSend, ServerConfig, ServerEvent, ServerHandle,
    };
    pub use kiosk_protocol::{
        Cart, Category, Codec, DataAdded, DataDeleted, EncryptComplete, Entity, EntityKind,
        Envelope, HandShake, Hello, JsonCodec, KeyExchange, Menu, MenuOption, OptionGroup, Order,
        OrderItem, OrderStatus, OrderStatusChanged, OrderUpdated, Packet, PacketType, RequestData,
        ResponseData, SelectedOption, SyncEntity, registry_ids,
    };
    pub use kiosk_registry::{
        CategoryRegistry, DescendingOrderId, DynRegistry, MenuRegistry, OptionGroupRegistry,
        OptionRegistry, OrderRegistry, RegistryManager, ReplaceById,
    };
    pub use kiosk_session::{HandshakeState, ServerKeyPair, Session};
    pub use kiosk_transport::{Connection, ConnectionId, WebSocketConnection};
}
