//! The synchronized registry: a typed, identity-indexed entity store.
//!
//! # Invariants
//!
//! All of a registry's indices live in one [`State`] behind one
//! `parking_lot::RwLock`, so they always move together:
//!
//! - `by_id` and `by_entity` are mutual inverses. Storing a value-equal
//!   entity under a second id evicts the first id.
//! - `slots` lists every id once, in insertion order; an id's position in
//!   it is the entity's **raw index**, dense from `0..len`. Replacing the
//!   entity behind an existing id keeps its slot; removals close the gap.
//! - `frozen` sits under the same lock as the data, so a freeze is
//!   ordered strictly before or after any in-flight mutation.
//!
//! No method does I/O or awaits while holding the lock.

use std::collections::HashMap;

use kiosk_protocol::{Entity, EntityKind, SyncEntity};
use parking_lot::RwLock;

use crate::{MergePolicy, RegistryError};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Everything one registry holds, guarded as a unit.
struct State<T> {
    frozen: bool,
    /// Ids in insertion order; position = raw index.
    slots: Vec<String>,
    raw: HashMap<String, usize>,
    by_id: HashMap<String, T>,
    by_entity: HashMap<T, String>,
}

impl<T: SyncEntity> State<T> {
    fn new() -> Self {
        Self {
            frozen: false,
            slots: Vec::new(),
            raw: HashMap::new(),
            by_id: HashMap::new(),
            by_entity: HashMap::new(),
        }
    }

    fn insert(&mut self, id: String, entity: T) {
        // Same value already filed under another id: drop that id.
        if let Some(old_id) = self.by_entity.get(&entity).cloned() {
            if old_id != id {
                self.remove(&old_id);
            }
        }

        match self.by_id.insert(id.clone(), entity.clone()) {
            Some(prior) => {
                if self.by_entity.get(&prior) == Some(&id) {
                    self.by_entity.remove(&prior);
                }
            }
            None => {
                self.raw.insert(id.clone(), self.slots.len());
                self.slots.push(id.clone());
            }
        }
        self.by_entity.insert(entity, id);
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(entity) = self.by_id.remove(id) else {
            return false;
        };
        if self.by_entity.get(&entity).map(String::as_str) == Some(id) {
            self.by_entity.remove(&entity);
        }
        if let Some(index) = self.raw.remove(id) {
            self.slots.remove(index);
            for (i, slot) in self.slots.iter().enumerate().skip(index) {
                self.raw.insert(slot.clone(), i);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.raw.clear();
        self.by_id.clear();
        self.by_entity.clear();
    }

    fn snapshot(&self) -> Vec<T> {
        self.slots
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A named, typed, thread-safe collection of one kind of entity.
///
/// `P` is the [`MergePolicy`] deciding how entities are filed and how
/// snapshots are ordered.
pub struct Registry<T: SyncEntity, P: MergePolicy<T>> {
    registry_id: String,
    policy: P,
    state: RwLock<State<T>>,
}

impl<T: SyncEntity, P: MergePolicy<T>> Registry<T, P> {
    /// Creates an empty, unfrozen registry.
    pub fn new(registry_id: impl Into<String>) -> Self {
        Self {
            registry_id: registry_id.into(),
            policy: P::default(),
            state: RwLock::new(State::new()),
        }
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    // -- Reads -------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<T> {
        self.state.read().by_id.get(id).cloned()
    }

    /// The entity at raw index `index`.
    pub fn get_by_raw(&self, index: usize) -> Option<T> {
        let state = self.state.read();
        let id = state.slots.get(index)?;
        state.by_id.get(id).cloned()
    }

    /// The raw index of a stored entity.
    pub fn raw_index_of(&self, entity: &T) -> Option<usize> {
        let state = self.state.read();
        let id = state.by_entity.get(entity)?;
        state.raw.get(id).copied()
    }

    /// The element id a stored entity is filed under.
    pub fn id_of(&self, entity: &T) -> Option<String> {
        self.state.read().by_entity.get(entity).cloned()
    }

    /// A copy of every entity, in the policy's order.
    pub fn get_all(&self) -> Vec<T> {
        let mut snapshot = self.state.read().snapshot();
        self.policy.arrange(&mut snapshot);
        snapshot
    }

    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().by_id.is_empty()
    }

    // -- Freeze ------------------------------------------------------------

    pub fn freeze(&self) {
        self.state.write().frozen = true;
    }

    pub fn unfreeze(&self) {
        self.state.write().frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen
    }

    // -- Guarded mutations -------------------------------------------------

    /// Stores `entity`, replacing whatever was filed under the same id.
    ///
    /// # Errors
    /// [`RegistryError::Frozen`] if the registry is frozen.
    pub fn add(&self, id: &str, entity: T) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        self.check_unfrozen(&state)?;
        let id = self.policy.element_id(id, &entity);
        state.insert(id, entity);
        Ok(())
    }

    /// Stores every entity under its own element id, in one critical
    /// section.
    pub fn add_all(&self, entities: Vec<T>) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        self.check_unfrozen(&state)?;
        for entity in entities {
            let id = self.policy.element_id(&entity.element_id(), &entity);
            state.insert(id, entity);
        }
        Ok(())
    }

    /// Removes the entity filed under `id`. Returns whether one existed.
    pub fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.write();
        self.check_unfrozen(&state)?;
        Ok(state.remove(id))
    }

    pub fn clear(&self) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        self.check_unfrozen(&state)?;
        state.clear();
        Ok(())
    }

    // -- Scoped transactions -----------------------------------------------

    /// Runs `f` with the write lock held and the freeze flag bypassed, then
    /// leaves the registry frozen before the lock is released.
    ///
    /// No other thread can observe the registry between the mutations in
    /// `f`, nor can a concurrent `freeze`/`unfreeze` interleave with them.
    pub fn with_unfrozen<R>(&self, f: impl FnOnce(&mut Txn<'_, T, P>) -> R) -> R {
        let mut state = self.state.write();
        let out = {
            let mut txn = Txn {
                state: &mut *state,
                policy: &self.policy,
            };
            f(&mut txn)
        };
        state.frozen = true;
        out
    }

    /// Swaps the whole contents for `entities` in one critical section.
    pub fn replace_all(&self, entities: Vec<T>) {
        self.with_unfrozen(|txn| {
            txn.clear();
            txn.add_all(entities);
        });
    }

    /// Adds or replaces one entity under its own element id, in one
    /// critical section, regardless of the freeze flag.
    pub fn upsert(&self, entity: T) {
        self.with_unfrozen(|txn| txn.add(&entity.element_id(), entity));
    }

    fn check_unfrozen(&self, state: &State<T>) -> Result<(), RegistryError> {
        if state.frozen {
            tracing::error!(registry_id = %self.registry_id, "mutation on frozen registry");
            return Err(RegistryError::Frozen {
                registry_id: self.registry_id.clone(),
            });
        }
        Ok(())
    }
}

impl<T: SyncEntity, P: MergePolicy<T>> std::fmt::Debug for Registry<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Registry")
            .field("registry_id", &self.registry_id)
            .field("kind", &T::KIND)
            .field("len", &state.by_id.len())
            .field("frozen", &state.frozen)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

/// Mutable access to a registry inside [`Registry::with_unfrozen`].
///
/// Operations here ignore the freeze flag; the enclosing call holds the
/// write lock for the whole closure.
pub struct Txn<'a, T: SyncEntity, P: MergePolicy<T>> {
    state: &'a mut State<T>,
    policy: &'a P,
}

impl<T: SyncEntity, P: MergePolicy<T>> Txn<'_, T, P> {
    pub fn add(&mut self, id: &str, entity: T) {
        let id = self.policy.element_id(id, &entity);
        self.state.insert(id, entity);
    }

    pub fn add_all(&mut self, entities: Vec<T>) {
        for entity in entities {
            let id = entity.element_id();
            self.add(&id, entity);
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.state.remove(id)
    }

    pub fn clear(&mut self) {
        self.state.clear();
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.state.by_id.get(id)
    }

    /// Every entity, in insertion order.
    pub fn get_all(&self) -> Vec<T> {
        self.state.snapshot()
    }

    pub fn len(&self) -> usize {
        self.state.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.by_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DynRegistry
// ---------------------------------------------------------------------------

/// A registry with its entity type erased to [`Entity`].
///
/// Dispatch code holds registries by id and only knows they store
/// *something*; these methods check the entity's declared kind against the
/// registry's before touching the store.
pub trait DynRegistry: Send + Sync {
    fn registry_id(&self) -> &str;

    /// The kind of entity this registry stores.
    fn kind(&self) -> EntityKind;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_frozen(&self) -> bool;

    fn freeze(&self);

    fn unfreeze(&self);

    fn get_entity(&self, id: &str) -> Option<Entity>;

    /// Every entity, in the registry's snapshot order.
    fn snapshot(&self) -> Vec<Entity>;

    /// [`Registry::add`] for an erased entity.
    fn add_entity(&self, id: &str, entity: Entity) -> Result<(), RegistryError>;

    /// [`Registry::add_all`]; nothing is stored unless every entity has the
    /// right kind.
    fn add_all_entities(&self, entities: Vec<Entity>) -> Result<(), RegistryError>;

    /// [`Registry::replace_all`]; on a kind mismatch the registry is left
    /// untouched.
    fn replace_all_entities(&self, entities: Vec<Entity>) -> Result<(), RegistryError>;

    /// [`Registry::upsert`] for an erased entity.
    fn upsert_entity(&self, entity: Entity) -> Result<(), RegistryError>;

    /// Removes one entity under a scoped transaction, regardless of the
    /// freeze flag.
    fn evict(&self, id: &str) -> bool;
}

impl<T: SyncEntity, P: MergePolicy<T>> Registry<T, P> {
    fn typed(&self, entity: Entity) -> Result<T, RegistryError> {
        T::try_from_entity(entity).map_err(|other| RegistryError::TypeMismatch {
            registry_id: self.registry_id.clone(),
            expected: T::KIND,
            found: other.kind(),
        })
    }

    fn typed_all(&self, entities: Vec<Entity>) -> Result<Vec<T>, RegistryError> {
        entities.into_iter().map(|e| self.typed(e)).collect()
    }
}

impl<T: SyncEntity, P: MergePolicy<T>> DynRegistry for Registry<T, P> {
    fn registry_id(&self) -> &str {
        &self.registry_id
    }

    fn kind(&self) -> EntityKind {
        T::KIND
    }

    fn len(&self) -> usize {
        Registry::len(self)
    }

    fn is_frozen(&self) -> bool {
        Registry::is_frozen(self)
    }

    fn freeze(&self) {
        Registry::freeze(self);
    }

    fn unfreeze(&self) {
        Registry::unfreeze(self);
    }

    fn get_entity(&self, id: &str) -> Option<Entity> {
        self.get(id).map(SyncEntity::into_entity)
    }

    fn snapshot(&self) -> Vec<Entity> {
        self.get_all().into_iter().map(SyncEntity::into_entity).collect()
    }

    fn add_entity(&self, id: &str, entity: Entity) -> Result<(), RegistryError> {
        let entity = self.typed(entity)?;
        self.add(id, entity)
    }

    fn add_all_entities(&self, entities: Vec<Entity>) -> Result<(), RegistryError> {
        let entities = self.typed_all(entities)?;
        self.add_all(entities)
    }

    fn replace_all_entities(&self, entities: Vec<Entity>) -> Result<(), RegistryError> {
        let entities = self.typed_all(entities)?;
        self.replace_all(entities);
        Ok(())
    }

    fn upsert_entity(&self, entity: Entity) -> Result<(), RegistryError> {
        let entity = self.typed(entity)?;
        self.upsert(entity);
        Ok(())
    }

    fn evict(&self, id: &str) -> bool {
        self.with_unfrozen(|txn| txn.remove(id))
    }
}

#[cfg(test)]
mod tests {
    use kiosk_protocol::{MenuOption, Order, OrderStatus};

    use super::*;
    use crate::{DescendingOrderId, ReplaceById};

    fn option(id: &str, cost: i64) -> MenuOption {
        MenuOption {
            id: id.into(),
            name: format!("option {id}"),
            extra_cost: cost,
        }
    }

    fn order(id: i64) -> Order {
        Order {
            order_id: id,
            customer: "walk-in".into(),
            order_time: 1_700_000_000_000,
            status: OrderStatus::Pending,
            cart: Default::default(),
        }
    }

    #[test]
    fn test_replace_keeps_slot() {
        let reg = Registry::<MenuOption, ReplaceById>::new("options");
        reg.add("a", option("a", 100)).unwrap();
        reg.add("b", option("b", 200)).unwrap();
        reg.add("a", option("a", 150)).unwrap();

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get_by_raw(0), Some(option("a", 150)));
        assert_eq!(reg.raw_index_of(&option("a", 150)), Some(0));
        assert_eq!(reg.id_of(&option("a", 100)), None);
    }

    #[test]
    fn test_equal_value_under_new_id_evicts_old_id() {
        let reg = Registry::<MenuOption, ReplaceById>::new("options");
        let shot = option("shot", 500);
        reg.add("first", shot.clone()).unwrap();
        reg.add("second", shot.clone()).unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("first"), None);
        assert_eq!(reg.id_of(&shot).as_deref(), Some("second"));
        assert_eq!(reg.raw_index_of(&shot), Some(0));
    }

    #[test]
    fn test_order_policy_ignores_proposed_id() {
        let reg = Registry::<Order, DescendingOrderId>::new("order");
        reg.add("whatever", order(42)).unwrap();

        assert_eq!(reg.get("42"), Some(order(42)));
        assert_eq!(reg.get("whatever"), None);
    }

    #[test]
    fn test_with_unfrozen_leaves_registry_frozen() {
        let reg = Registry::<MenuOption, ReplaceById>::new("options");
        reg.freeze();

        let stored = reg.with_unfrozen(|txn| {
            txn.add("a", option("a", 1));
            txn.len()
        });

        assert_eq!(stored, 1);
        assert!(reg.is_frozen());
        assert!(matches!(
            reg.add("b", option("b", 2)),
            Err(RegistryError::Frozen { .. })
        ));
    }

    #[test]
    fn test_dyn_type_mismatch_leaves_registry_untouched() {
        let reg = Registry::<MenuOption, ReplaceById>::new("options");
        reg.add("keep", option("keep", 1)).unwrap();

        let batch = vec![option("x", 1).into(), order(1).into()];
        let err = reg.replace_all_entities(batch).unwrap_err();

        match err {
            RegistryError::TypeMismatch { expected, found, .. } => {
                assert_eq!(expected, EntityKind::MenuOption);
                assert_eq!(found, EntityKind::Order);
            }
            other => panic!("expected TypeMismatch, got {other}"),
        }
        assert_eq!(reg.get_all(), vec![option("keep", 1)]);
        assert!(!reg.is_frozen());
    }

    #[test]
    fn test_dyn_snapshot_is_erased() {
        let reg = Registry::<Order, DescendingOrderId>::new("order");
        reg.upsert(order(1));
        reg.upsert(order(3));

        let snapshot = DynRegistry::snapshot(&reg);
        let ids: Vec<String> = snapshot.iter().map(Entity::element_id).collect();
        assert_eq!(ids, ["3", "1"]);
        assert_eq!(DynRegistry::kind(&reg), EntityKind::Order);
    }
}
