//! What each side does with a packet once its session is encrypted.
//!
//! Dispatch is a `match` over [`Packet`] per side, so a new packet type
//! does not compile until both sides decide what to do with it. Handlers
//! return the packets to send back to the sender; anything meant for other
//! peers goes out through the server's peer table directly.
//!
//! Registry work happens in one critical section per registry
//! (`replace_all`, `upsert`, `with_unfrozen`), and never while awaiting.

use std::sync::atomic::Ordering;

use kiosk_protocol::{
    Category, DataDeleted, Entity, EntityKind, Order, OrderStatus, OrderUpdated, Packet,
    ProtocolError, RequestData, ResponseData, SyncEntity, registry_ids,
};
use kiosk_registry::{RegistryError, RegistryManager, ReplaceById};
use kiosk_session::SessionError;
use kiosk_transport::ConnectionId;
use tokio::sync::broadcast;

use crate::server::ServerShared;
use crate::{ClientEvent, KioskError, ServerEvent};

// ---------------------------------------------------------------------------
// Shared by both sides
// ---------------------------------------------------------------------------

/// `ResponseData` for one registry, or for every registry when asked for
/// `"all"`.
pub(crate) fn snapshot_responses(
    registries: &RegistryManager,
    request: &RequestData,
) -> Result<Vec<Packet>, RegistryError> {
    if request.registry_id == registry_ids::ALL {
        return Ok(registries
            .iter()
            .map(|registry| snapshot_of(registry.registry_id(), registry.snapshot()))
            .collect());
    }
    let registry = registries.require(&request.registry_id)?;
    Ok(vec![snapshot_of(registry.registry_id(), registry.snapshot())])
}

fn snapshot_of(registry_id: &str, entities: Vec<Entity>) -> Packet {
    Packet::ResponseData(ResponseData {
        registry_id: registry_id.to_string(),
        entities,
    })
}

/// Replaces a registry's contents with a received snapshot.
fn apply_snapshot(
    registries: &RegistryManager,
    response: ResponseData,
) -> Result<String, RegistryError> {
    let registry = registries.require(&response.registry_id)?;
    let count = response.entities.len();
    registry.replace_all_entities(response.entities)?;
    tracing::debug!(registry_id = %response.registry_id, count, "applied snapshot");
    Ok(response.registry_id)
}

fn not_after_handshake(packet_id: &str) -> KioskError {
    SessionError::ProtocolViolation(format!("{packet_id} after handshake completed")).into()
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Handles one packet from the kiosk on `conn_id`.
pub(crate) fn on_server_packet(
    shared: &ServerShared,
    conn_id: ConnectionId,
    packet: Packet,
) -> Result<Vec<Packet>, KioskError> {
    let packet_id = packet.id();
    match packet {
        Packet::HandShake(_) | Packet::KeyExchange(_) => Err(not_after_handshake(packet_id)),

        Packet::Hello(_) | Packet::EncryptComplete(_) | Packet::OrderUpdated(_) => {
            tracing::warn!(%conn_id, packet_id, "client-bound packet sent to server; dropped");
            Ok(Vec::new())
        }

        Packet::RequestData(request) => Ok(snapshot_responses(&shared.registries, &request)?),

        // Kiosks may push catalog snapshots; the order registry is only
        // ever written through `accept_order`.
        Packet::ResponseData(response) if response.registry_id == registry_ids::ORDERS => {
            tracing::warn!(%conn_id, "order snapshot from a kiosk; dropped");
            Ok(Vec::new())
        }

        Packet::ResponseData(response) => {
            let registry_id = apply_snapshot(&shared.registries, response)?;
            rebroadcast(shared, &registry_id, Some(conn_id))?;
            Ok(Vec::new())
        }

        Packet::DataAdded(added) => {
            let registry = shared.registries.require(&added.registry_id)?;
            if let Entity::Order(order) = &added.entity {
                bump_order_id(shared, order.order_id);
            }
            registry.upsert_entity(added.entity)?;
            tracing::info!(%conn_id, registry_id = %added.registry_id, "entity added");
            rebroadcast(shared, &added.registry_id, None)?;
            Ok(Vec::new())
        }

        Packet::DataDeleted(deleted) => {
            let touched = delete_with_cascade(&shared.registries, &deleted)?;
            tracing::info!(
                %conn_id,
                registry_id = %deleted.registry_id,
                entity_id = %deleted.entity_id,
                touched = touched.len(),
                "entity deleted"
            );
            for registry_id in &touched {
                rebroadcast(shared, registry_id, None)?;
            }
            Ok(Vec::new())
        }

        Packet::OrderStatusChanged(changed) => accept_order(shared, conn_id, changed.order),
    }
}

/// Stores the canonical version of an order and tells everyone else.
///
/// An order without an id is a fresh checkout: it gets the next id and,
/// if still pending, is accepted. The sender only hears back when the
/// server changed what it sent.
fn accept_order(
    shared: &ServerShared,
    conn_id: ConnectionId,
    submitted: Order,
) -> Result<Vec<Packet>, KioskError> {
    let orders = shared
        .registries
        .orders()
        .ok_or_else(|| RegistryError::UnknownRegistry(registry_ids::ORDERS.to_string()))?;

    let mut canonical = submitted.clone();
    if canonical.is_unassigned() {
        canonical.order_id = assign_order_id(shared)?;
        if canonical.status == OrderStatus::Pending {
            canonical.status = OrderStatus::Accepted;
        }
    } else {
        bump_order_id(shared, canonical.order_id);
    }

    orders.upsert(canonical.clone());
    tracing::info!(
        %conn_id,
        order_id = canonical.order_id,
        status = %canonical.status,
        "order stored"
    );
    shared.emit(ServerEvent::OrderChanged {
        order: canonical.clone(),
    });

    let update = Packet::OrderUpdated(OrderUpdated {
        order: canonical.clone(),
    });
    shared.peers.broadcast(&update, Some(conn_id));

    if canonical != submitted {
        Ok(vec![update])
    } else {
        Ok(Vec::new())
    }
}

/// Hands out the next order id. Fails once the id space is used up.
fn assign_order_id(shared: &ServerShared) -> Result<i64, ProtocolError> {
    shared
        .next_order_id
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| next.checked_add(1))
        .map_err(|_| ProtocolError::InvalidMessage("order ids exhausted".into()))
}

/// Keeps fresh ids above an explicitly numbered order.
fn bump_order_id(shared: &ServerShared, order_id: i64) {
    shared
        .next_order_id
        .fetch_max(order_id.saturating_add(1), Ordering::SeqCst);
}

/// Removes one entity and everything that referred to it. Returns the ids
/// of every registry that changed.
///
/// - deleting a menu strips it from every category that lists it;
/// - deleting a category removes its menus from the menu registry.
fn delete_with_cascade(
    registries: &RegistryManager,
    deleted: &DataDeleted,
) -> Result<Vec<String>, RegistryError> {
    let registry = registries.require(&deleted.registry_id)?;
    let entity_id = deleted.entity_id.as_str();
    let mut touched = Vec::new();

    match registry.kind() {
        EntityKind::Menu => {
            if registry.evict(entity_id) {
                touched.push(deleted.registry_id.clone());
            }
            if let Some(categories) = registries.categories() {
                let stripped = categories.with_unfrozen(|txn| {
                    let updated: Vec<Category> = txn
                        .get_all()
                        .iter()
                        .filter_map(|c| c.without_menu(entity_id))
                        .collect();
                    let count = updated.len();
                    for category in updated {
                        let id = category.id.clone();
                        txn.add(&id, category);
                    }
                    count
                });
                if stripped > 0 {
                    touched.push(categories.registry_id().to_string());
                }
            }
        }

        EntityKind::Category => {
            let removed = registries
                .typed::<Category, ReplaceById>(&deleted.registry_id)
                .and_then(|categories| {
                    categories.with_unfrozen(|txn| {
                        let category = txn.get(entity_id).cloned();
                        txn.remove(entity_id);
                        category
                    })
                });
            let Some(removed) = removed else {
                return Ok(touched);
            };
            touched.push(deleted.registry_id.clone());

            if let Some(menus) = registries.menus() {
                let dropped = menus.with_unfrozen(|txn| {
                    let doomed: Vec<String> = txn
                        .get_all()
                        .into_iter()
                        .filter(|m| {
                            m.category_id == removed.id
                                || removed.menus.iter().any(|listed| listed.id == m.id)
                        })
                        .map(|m| m.id)
                        .collect();
                    doomed.iter().filter(|id| txn.remove(id)).count()
                });
                if dropped > 0 {
                    touched.push(menus.registry_id().to_string());
                }
            }
        }

        EntityKind::Order | EntityKind::MenuOption | EntityKind::OptionGroup => {
            if registry.evict(entity_id) {
                touched.push(deleted.registry_id.clone());
            }
        }
    }

    Ok(touched)
}

/// Sends every encrypted kiosk (but `except`) a fresh snapshot of one
/// registry.
fn rebroadcast(
    shared: &ServerShared,
    registry_id: &str,
    except: Option<ConnectionId>,
) -> Result<(), RegistryError> {
    let registry = shared.registries.require(registry_id)?;
    let packet = snapshot_of(registry_id, registry.snapshot());
    let sent = shared.peers.broadcast(&packet, except);
    tracing::debug!(registry_id, peers = sent, "rebroadcast registry");
    shared.emit(ServerEvent::RegistryChanged {
        registry_id: registry_id.to_string(),
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Handles one packet from the server.
pub(crate) fn on_client_packet(
    registries: &RegistryManager,
    events: &broadcast::Sender<ClientEvent>,
    packet: Packet,
) -> Result<Vec<Packet>, KioskError> {
    let packet_id = packet.id();
    match packet {
        Packet::Hello(_) | Packet::EncryptComplete(_) => Err(not_after_handshake(packet_id)),

        Packet::HandShake(_)
        | Packet::KeyExchange(_)
        | Packet::DataAdded(_)
        | Packet::DataDeleted(_) => {
            tracing::warn!(packet_id, "server-bound packet sent to client; dropped");
            Ok(Vec::new())
        }

        Packet::RequestData(request) => Ok(snapshot_responses(registries, &request)?),

        Packet::ResponseData(response) => {
            let registry_id = apply_snapshot(registries, response)?;
            let _ = events.send(ClientEvent::RegistrySynced { registry_id });
            Ok(Vec::new())
        }

        Packet::OrderStatusChanged(changed) => {
            store_order(registries, events, changed.order)?;
            Ok(Vec::new())
        }

        Packet::OrderUpdated(updated) => {
            store_order(registries, events, updated.order)?;
            Ok(Vec::new())
        }
    }
}

/// Upserts the server's version of an order in one critical section.
fn store_order(
    registries: &RegistryManager,
    events: &broadcast::Sender<ClientEvent>,
    order: Order,
) -> Result<(), RegistryError> {
    let orders = registries
        .orders()
        .ok_or_else(|| RegistryError::UnknownRegistry(registry_ids::ORDERS.to_string()))?;
    let order_id = order.order_id;

    orders.with_unfrozen(|txn| {
        if let Some(existing) = txn.get(&order.element_id()) {
            if existing.cart != order.cart {
                tracing::warn!(order_id, "server order differs from local cart; taking server's");
            }
        }
        let id = order.element_id();
        txn.add(&id, order);
    });

    tracing::debug!(order_id, "order updated");
    let _ = events.send(ClientEvent::OrderUpdated { order_id });
    Ok(())
}
