//! Merge policies: the per-registry rules layered on the common store.
//!
//! A registry is `Registry<T, P>` where `P` decides two things the store
//! itself is neutral about: which element id an incoming entity is filed
//! under, and the order in which a snapshot is handed out.

use kiosk_protocol::{Order, SyncEntity};

/// Per-registry rules for filing entities and ordering snapshots.
pub trait MergePolicy<T: SyncEntity>: Default + Send + Sync + 'static {
    /// The element id `entity` is stored under when the caller proposes
    /// `proposed`.
    fn element_id(&self, proposed: &str, entity: &T) -> String;

    /// Reorders a snapshot (in insertion order) before it is returned.
    fn arrange(&self, _snapshot: &mut Vec<T>) {}
}

/// Files entities under the id the caller gives and keeps insertion order.
/// Used for every catalog registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceById;

impl<T: SyncEntity> MergePolicy<T> for ReplaceById {
    fn element_id(&self, proposed: &str, _entity: &T) -> String {
        proposed.to_string()
    }
}

/// The order registry's rules: one entry per order id, whatever id the
/// caller passes, and newest (highest id) first.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescendingOrderId;

impl MergePolicy<Order> for DescendingOrderId {
    fn element_id(&self, _proposed: &str, order: &Order) -> String {
        order.element_id()
    }

    fn arrange(&self, snapshot: &mut Vec<Order>) {
        snapshot.sort_by(|a, b| b.order_id.cmp(&a.order_id));
    }
}
