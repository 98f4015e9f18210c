//! `KioskClient`: the kiosk's single link to the order server.
//!
//! A client owns four background tasks:
//!
//! ```text
//! reconnect  every reconnect_interval, or when a send finds no link
//! drain      every drain_interval, and right after the link encrypts
//! sync       every sync_interval: RequestData("all")
//! link       one per live connection: handshake, then read/write loop
//! ```
//!
//! # The outbox
//!
//! Everything that decides *where* a packet goes shares one lock, the
//! outbox, which is separate from every registry lock:
//!
//! - [`send`](KioskClient::send) goes straight to the link only when the
//!   link is encrypted and nothing is pending; otherwise it queues, so a
//!   packet never overtakes an older pending one;
//! - draining moves the pending queue onto the link in FIFO order;
//! - installing and tearing down a link.
//!
//! The lock is never held across an `.await`: the link's queue is an
//! unbounded channel, so handing it a packet never waits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kiosk_protocol::{JsonCodec, Order, OrderStatusChanged, Packet, RequestData, Side, registry_ids};
use kiosk_registry::RegistryManager;
use kiosk_session::{Session, SessionError};
use kiosk_transport::{Connection, TransportError, WebSocketConnection};
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::dispatch::on_client_packet;
use crate::events::EVENT_CAPACITY;
use crate::framing;
use crate::{ClientConfig, ClientEvent, KioskError};

// ---------------------------------------------------------------------------
// PendingSend
// ---------------------------------------------------------------------------

/// Completion of a packet handed straight to a live link.
#[derive(Debug)]
pub struct PendingSend {
    rx: oneshot::Receiver<Result<(), KioskError>>,
}

impl PendingSend {
    /// Waits until the packet was written to the socket, or failed.
    pub async fn wait(self) -> Result<(), KioskError> {
        self.rx
            .await
            .unwrap_or(Err(TransportError::Disconnected.into()))
    }
}

/// A packet on its way to the link task.
struct Outbound {
    packet: Packet,
    done: Option<oneshot::Sender<Result<(), KioskError>>>,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

struct LinkSlot {
    /// Distinguishes this link from the ones before and after it.
    generation: u64,
    encrypted: bool,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct Outbox {
    link: Option<LinkSlot>,
    pending: VecDeque<Packet>,
}

impl Outbox {
    fn live(&self) -> Option<&LinkSlot> {
        self.link.as_ref().filter(|link| link.encrypted)
    }

    /// Moves pending packets onto the live link. Returns how many moved.
    fn drain(&mut self) -> usize {
        let Some(link) = self.live() else {
            return 0;
        };
        let tx = link.tx.clone();
        let mut moved = 0;
        while let Some(packet) = self.pending.pop_front() {
            if let Err(mpsc::error::SendError(back)) = tx.send(Outbound { packet, done: None }) {
                // The link task is gone; keep the packet for the next link.
                self.pending.push_front(back.packet);
                self.link = None;
                break;
            }
            moved += 1;
        }
        moved
    }
}

// ---------------------------------------------------------------------------
// KioskClient
// ---------------------------------------------------------------------------

struct ClientInner {
    config: ClientConfig,
    registries: Arc<RegistryManager>,
    codec: JsonCodec,
    outbox: Mutex<Outbox>,
    connecting: AtomicBool,
    next_generation: AtomicU64,
    reconnect_now: Notify,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    link_task: Mutex<Option<JoinHandle<()>>>,
}

/// A kiosk's connection to the order server.
///
/// Cloning is cheap; every clone drives the same connection.
#[derive(Clone)]
pub struct KioskClient {
    inner: Arc<ClientInner>,
}

impl KioskClient {
    /// Starts the client's background tasks. The first connection attempt
    /// happens right away.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: ClientConfig, registries: Arc<RegistryManager>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(ClientInner {
            config,
            registries,
            codec: JsonCodec,
            outbox: Mutex::new(Outbox::default()),
            connecting: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            reconnect_now: Notify::new(),
            events,
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            link_task: Mutex::new(None),
        });

        tracing::info!(
            client_id = %inner.config.client_id,
            addr = %inner.config.addr(),
            "kiosk client starting"
        );
        tokio::spawn(reconnect_loop(Arc::clone(&inner)));
        tokio::spawn(drain_loop(Arc::clone(&inner)));
        tokio::spawn(sync_loop(Arc::clone(&inner)));

        Self { inner }
    }

    /// Sends a packet to the server.
    ///
    /// Returns a completion handle when the packet went straight to a live
    /// encrypted link. Otherwise the packet joins the pending queue, a
    /// reconnect is triggered if none is in flight, and `None` is returned;
    /// the packet is sent once a link is encrypted again.
    pub fn send(&self, packet: Packet) -> Option<PendingSend> {
        self.inner.send(packet)
    }

    /// Submits an order (a fresh checkout has `order_id <= 0`).
    pub fn submit_order(&self, order: Order) -> Option<PendingSend> {
        self.send(Packet::OrderStatusChanged(OrderStatusChanged { order }))
    }

    /// Asks the server for a full snapshot of every registry.
    pub fn request_all(&self) -> Option<PendingSend> {
        self.send(request_all())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn registries(&self) -> &Arc<RegistryManager> {
        &self.inner.registries
    }

    /// Returns `true` while an encrypted link is up.
    pub fn is_encrypted(&self) -> bool {
        self.inner.outbox.lock().live().is_some()
    }

    /// Packets waiting for a link.
    pub fn pending_len(&self) -> usize {
        self.inner.outbox.lock().pending.len()
    }

    /// Closes the link and stops every background task.
    ///
    /// Safe to call from many tasks at once; only the first call does
    /// anything, the rest return immediately.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(client_id = %self.inner.config.client_id, "kiosk client shutting down");
        self.inner.cancel.cancel();
        self.inner.outbox.lock().link = None;

        let link_task = self.inner.link_task.lock().take();
        if let Some(handle) = link_task {
            let _ = handle.await;
        }
    }
}

impl ClientInner {
    fn send(&self, packet: Packet) -> Option<PendingSend> {
        let mut outbox = self.outbox.lock();

        if outbox.pending.is_empty() {
            if let Some(link) = outbox.live() {
                let (done, rx) = oneshot::channel();
                match link.tx.send(Outbound {
                    packet,
                    done: Some(done),
                }) {
                    Ok(()) => return Some(PendingSend { rx }),
                    Err(mpsc::error::SendError(back)) => {
                        outbox.link = None;
                        outbox.pending.push_back(back.packet);
                        drop(outbox);
                        self.trigger_reconnect();
                        return None;
                    }
                }
            }
        }

        tracing::debug!(packet_id = packet.id(), queued = outbox.pending.len() + 1, "queued packet");
        outbox.pending.push_back(packet);
        let has_link = outbox.link.is_some();
        drop(outbox);
        if !has_link {
            self.trigger_reconnect();
        }
        None
    }

    fn trigger_reconnect(&self) {
        if !self.connecting.load(Ordering::SeqCst) && !self.cancel.is_cancelled() {
            self.reconnect_now.notify_one();
        }
    }

    fn drain(&self) {
        let moved = self.outbox.lock().drain();
        if moved > 0 {
            tracing::debug!(moved, "drained pending packets");
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// One connection attempt. At most one runs at a time.
    async fn try_connect(self: &Arc<Self>) {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let addr = self.config.addr();
        let connected =
            tokio::time::timeout(self.config.handshake_timeout, WebSocketConnection::connect(&addr))
                .await;

        match connected {
            Ok(Ok(conn)) if !self.cancel.is_cancelled() => self.install_link(conn),
            Ok(Ok(conn)) => {
                let _ = conn.close().await;
            }
            Ok(Err(e)) => tracing::debug!(%addr, error = %e, "connect failed"),
            Err(_) => tracing::debug!(%addr, "connect timed out"),
        }
        self.connecting.store(false, Ordering::SeqCst);
    }

    fn install_link(self: &Arc<Self>, conn: WebSocketConnection) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbox.lock().link = Some(LinkSlot {
            generation,
            encrypted: false,
            tx,
        });
        tracing::info!(conn_id = %conn.id(), addr = %self.config.addr(), "connected to server");
        self.emit(ClientEvent::Connected);

        let handle = tokio::spawn(run_link(Arc::clone(self), conn, rx, generation));
        *self.link_task.lock() = Some(handle);
    }

    /// The link finished its handshake: open it to traffic and flush.
    fn on_encrypted(&self, generation: u64) {
        let moved = {
            let mut outbox = self.outbox.lock();
            match outbox.link.as_mut() {
                Some(link) if link.generation == generation => link.encrypted = true,
                _ => return,
            }
            outbox.drain()
        };
        tracing::info!(client_id = %self.config.client_id, drained = moved, "link encrypted");
        self.emit(ClientEvent::Encrypted);
        self.send(request_all());
    }

    fn teardown(&self, generation: u64) {
        let mut outbox = self.outbox.lock();
        if outbox.link.as_ref().is_some_and(|link| link.generation == generation) {
            outbox.link = None;
        }
    }
}

fn request_all() -> Packet {
    Packet::RequestData(RequestData {
        registry_id: registry_ids::ALL.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn reconnect_loop(inner: Arc<ClientInner>) {
    let mut tick = tokio::time::interval(inner.config.reconnect_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tick.tick() => {}
            _ = inner.reconnect_now.notified() => {}
        }
        if inner.outbox.lock().link.is_some() {
            continue;
        }
        inner.try_connect().await;
    }
}

async fn drain_loop(inner: Arc<ClientInner>) {
    let mut tick = tokio::time::interval(inner.config.drain_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tick.tick() => inner.drain(),
        }
    }
}

async fn sync_loop(inner: Arc<ClientInner>) {
    let period = inner.config.sync_interval;
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tick.tick() => {
                if inner.outbox.lock().live().is_some() {
                    tracing::debug!("periodic full sync");
                    inner.send(request_all());
                }
            }
        }
    }
}

/// Drives one connection from handshake to close.
async fn run_link(
    inner: Arc<ClientInner>,
    conn: WebSocketConnection,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    generation: u64,
) {
    let conn_id = conn.id();
    let mut session = Session::client(inner.config.client_id.clone());

    let handshake = tokio::select! {
        _ = inner.cancel.cancelled() => Ok(Err(KioskError::from(TransportError::Shutdown))),
        result = tokio::time::timeout(
            inner.config.handshake_timeout,
            client_handshake(&conn, &inner.codec, &mut session),
        ) => result,
    };

    let result = match handshake {
        Ok(Ok(())) => {
            inner.on_encrypted(generation);
            serve_link(&inner, &conn, &mut session, &mut rx).await
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            session.fail();
            Err(SessionError::HandshakeTimeout.into())
        }
    };

    inner.teardown(generation);
    match result {
        Ok(()) => tracing::info!(%conn_id, "link closed"),
        Err(e) => tracing::warn!(%conn_id, error = %e, "link lost"),
    }
    let _ = conn.close().await;
    inner.emit(ClientEvent::Disconnected);
}

/// The client half of the handshake.
async fn client_handshake(
    conn: &WebSocketConnection,
    codec: &JsonCodec,
    session: &mut Session,
) -> Result<(), KioskError> {
    let hello = session.begin()?;
    framing::send(conn, codec, session, &Packet::HandShake(hello)).await?;

    while !session.is_encrypted() {
        let frame = framing::recv_frame(conn).await?;
        let packet = match framing::decode(codec, session, &frame) {
            Ok(packet) => packet,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(conn_id = %conn.id(), error = %e, "dropping undecodable handshake frame");
                continue;
            }
        };
        match packet {
            Packet::Hello(hello) => {
                let kx = session.accept_hello(hello)?;
                framing::send(conn, codec, session, &Packet::KeyExchange(kx)).await?;
            }
            Packet::EncryptComplete(done) => session.accept_encrypt_complete(&done)?,
            other => {
                session.fail();
                return Err(SessionError::ProtocolViolation(format!(
                    "{} during handshake",
                    other.id()
                ))
                .into());
            }
        }
    }
    Ok(())
}

/// The read/write loop of an encrypted link.
async fn serve_link(
    inner: &ClientInner,
    conn: &WebSocketConnection,
    session: &mut Session,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Result<(), KioskError> {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),

            outbound = rx.recv() => {
                // Sender dropped: the link was taken down from outside.
                let Some(Outbound { packet, done }) = outbound else { return Ok(()) };
                let result = framing::send(conn, &inner.codec, session, &packet).await;
                let fatal = result.as_ref().err().map(|e| e.to_string());
                if let Some(done) = done {
                    let _ = done.send(result);
                }
                if let Some(reason) = fatal {
                    return Err(TransportError::ConnectionClosed(reason).into());
                }
            }

            frame = conn.recv() => {
                let Some(frame) = frame? else { return Ok(()) };
                let packet = match framing::decode(&inner.codec, session, &frame) {
                    Ok(packet) => packet,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping frame");
                        continue;
                    }
                };
                tracing::debug!(packet_id = packet.id(), "received packet");

                if !packet.packet_type().is_accepted_by(Side::Client) {
                    tracing::warn!(packet_id = packet.id(), "packet not for client; dropped");
                    continue;
                }
                let replies = match on_client_packet(&inner.registries, &inner.events, packet) {
                    Ok(replies) => replies,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "packet dropped");
                        continue;
                    }
                };
                for reply in &replies {
                    framing::send(conn, &inner.codec, session, reply).await?;
                }
            }
        }
    }
}
