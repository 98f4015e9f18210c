//! `KioskServer` builder and accept loop.
//!
//! This is the entry point for running the order server. It ties together
//! all the layers: transport → session → protocol → registries.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use kiosk_protocol::{JsonCodec, Packet};
use kiosk_registry::RegistryManager;
use kiosk_session::{PeerTable, ServerKeyPair};
use kiosk_transport::{ConnectionId, Transport, WebSocketTransport};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::EVENT_CAPACITY;
use crate::handler::handle_connection;
use crate::{KioskError, ServerConfig, ServerEvent};

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) keys: Arc<ServerKeyPair>,
    pub(crate) registries: Arc<RegistryManager>,
    /// Outbound queues of every connected kiosk. Each handler task seals
    /// what it pulls from its own queue.
    pub(crate) peers: PeerTable<Packet>,
    pub(crate) codec: JsonCodec,
    /// Next id handed to a fresh checkout.
    pub(crate) next_order_id: AtomicI64,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    pub(crate) shutdown: CancellationToken,
}

impl ServerShared {
    pub(crate) fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Builder for configuring and starting a kiosk server.
///
/// # Example
///
/// ```rust,ignore
/// use kiosk::prelude::*;
///
/// let server = KioskServer::builder()
///     .bind("0.0.0.0:9000")
///     .registries(Arc::new(RegistryManager::standard()))
///     .build()
///     .await?;
/// server.run().await
/// ```
pub struct KioskServerBuilder {
    config: ServerConfig,
    keys: Option<Arc<ServerKeyPair>>,
    registries: Option<Arc<RegistryManager>>,
}

impl KioskServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            keys: None,
            registries: None,
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Replaces the whole configuration, bind address included.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a stored key pair instead of generating one.
    pub fn key_pair(mut self, keys: Arc<ServerKeyPair>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// The registries to serve. Defaults to the standard set, empty.
    pub fn registries(mut self, registries: Arc<RegistryManager>) -> Self {
        self.registries = Some(registries);
        self
    }

    /// Binds the listener and prepares the shared state.
    pub async fn build(self) -> Result<KioskServer, KioskError> {
        let transport = WebSocketTransport::bind(&self.config.bind_addr).await?;

        let registries = self
            .registries
            .unwrap_or_else(|| Arc::new(RegistryManager::standard()));
        let first_order_id = registries
            .orders()
            .and_then(|orders| orders.get_all().first().map(|o| o.order_id))
            .map_or(1, |highest| highest.max(0).saturating_add(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(ServerShared {
            config: self.config,
            keys: self.keys.unwrap_or_else(|| Arc::new(ServerKeyPair::generate())),
            registries,
            peers: PeerTable::new(),
            codec: JsonCodec,
            next_order_id: AtomicI64::new(first_order_id),
            events,
            shutdown: CancellationToken::new(),
        });

        Ok(KioskServer { transport, shared })
    }
}

impl Default for KioskServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound kiosk server.
///
/// Call [`run()`](Self::run) to start accepting connections. Grab a
/// [`ServerHandle`] first if anything else needs to reach the server
/// while it runs.
pub struct KioskServer {
    transport: WebSocketTransport,
    shared: Arc<ServerShared>,
}

impl KioskServer {
    /// Creates a new builder.
    pub fn builder() -> KioskServerBuilder {
        KioskServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// A cloneable handle for broadcasting, inspecting and stopping the
    /// server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the accept loop until [`ServerHandle::shutdown`] is called.
    ///
    /// Every accepted connection gets its own handler task.
    pub async fn run(mut self) -> Result<(), KioskError> {
        tracing::info!(addr = %self.shared.config.bind_addr, "kiosk server running");

        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, shared).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        self.transport.shutdown().await?;
        tracing::info!("kiosk server stopped");
        Ok(())
    }
}

/// Handle to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    /// Queues `packet` for every encrypted kiosk except `except`.
    /// Returns how many kiosks it was queued for.
    pub fn broadcast(&self, packet: Packet, except: Option<ConnectionId>) -> usize {
        self.shared.peers.broadcast(&packet, except)
    }

    pub fn registries(&self) -> &Arc<RegistryManager> {
        &self.shared.registries
    }

    /// Kiosks that finished the handshake.
    pub fn connected_peers(&self) -> usize {
        self.shared.peers.encrypted_count()
    }

    pub fn public_key(&self) -> [u8; kiosk_session::KEY_SIZE] {
        self.shared.keys.public_key()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Stops accepting and closes every connection. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            tracing::info!("kiosk server shutting down");
            self.shared.shutdown.cancel();
        }
    }
}
