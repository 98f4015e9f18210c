//! The registry manager: every registry a node keeps, by id.
//!
//! Built once at startup, then wrapped in an `Arc` and handed to the
//! server or client. Registration takes `&mut self`, so once the manager is
//! shared no registry can be added or removed while someone is looking one
//! up. The registries themselves stay individually locked.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use kiosk_protocol::{Category, Menu, MenuOption, OptionGroup, Order, SyncEntity, registry_ids};

use crate::{DescendingOrderId, DynRegistry, MergePolicy, Registry, RegistryError, ReplaceById};

pub type OrderRegistry = Registry<Order, DescendingOrderId>;
pub type MenuRegistry = Registry<Menu, ReplaceById>;
pub type CategoryRegistry = Registry<Category, ReplaceById>;
pub type OptionRegistry = Registry<MenuOption, ReplaceById>;
pub type OptionGroupRegistry = Registry<OptionGroup, ReplaceById>;

struct Slot {
    erased: Arc<dyn DynRegistry>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Registries by id, in registration order.
#[derive(Default)]
pub struct RegistryManager {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl RegistryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager holding the five standard registries, unfrozen and empty.
    pub fn standard() -> Self {
        let mut manager = Self::new();
        // The standard ids are distinct and none is reserved.
        let _ = manager.register(OrderRegistry::new(registry_ids::ORDERS));
        let _ = manager.register(MenuRegistry::new(registry_ids::MENUS));
        let _ = manager.register(CategoryRegistry::new(registry_ids::CATEGORIES));
        let _ = manager.register(OptionRegistry::new(registry_ids::OPTIONS));
        let _ = manager.register(OptionGroupRegistry::new(registry_ids::OPTION_GROUPS));
        manager
    }

    /// Adds a registry under its own id and returns a typed handle to it.
    ///
    /// # Errors
    /// [`RegistryError::DuplicateRegistry`] if the id is taken or is the
    /// reserved `"all"`.
    pub fn register<T: SyncEntity, P: MergePolicy<T>>(
        &mut self,
        registry: Registry<T, P>,
    ) -> Result<Arc<Registry<T, P>>, RegistryError> {
        let id = registry.registry_id().to_string();
        if id == registry_ids::ALL || self.index.contains_key(&id) {
            return Err(RegistryError::DuplicateRegistry(id));
        }

        let registry = Arc::new(registry);
        self.index.insert(id.clone(), self.slots.len());
        self.slots.push(Slot {
            erased: registry.clone(),
            any: registry.clone(),
        });
        tracing::debug!(registry_id = %id, kind = %T::KIND, "registry registered");
        Ok(registry)
    }

    /// The registry under `registry_id`, type-erased.
    pub fn get(&self, registry_id: &str) -> Option<Arc<dyn DynRegistry>> {
        self.index
            .get(registry_id)
            .map(|&i| Arc::clone(&self.slots[i].erased))
    }

    /// Like [`get`](Self::get) but reports a missing id as an error.
    pub fn require(&self, registry_id: &str) -> Result<Arc<dyn DynRegistry>, RegistryError> {
        self.get(registry_id)
            .ok_or_else(|| RegistryError::UnknownRegistry(registry_id.to_string()))
    }

    /// The registry under `registry_id` with its concrete type, if it has
    /// that type.
    pub fn typed<T: SyncEntity, P: MergePolicy<T>>(
        &self,
        registry_id: &str,
    ) -> Option<Arc<Registry<T, P>>> {
        let &i = self.index.get(registry_id)?;
        Arc::clone(&self.slots[i].any).downcast().ok()
    }

    pub fn orders(&self) -> Option<Arc<OrderRegistry>> {
        self.typed(registry_ids::ORDERS)
    }

    pub fn menus(&self) -> Option<Arc<MenuRegistry>> {
        self.typed(registry_ids::MENUS)
    }

    pub fn categories(&self) -> Option<Arc<CategoryRegistry>> {
        self.typed(registry_ids::CATEGORIES)
    }

    /// Every registry, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DynRegistry>> {
        self.slots.iter().map(|slot| &slot.erased)
    }

    /// Registry ids, in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.erased.registry_id())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Freezes every registry. Called once the initial data is loaded.
    pub fn freeze_all(&self) {
        for registry in self.iter() {
            registry.freeze();
        }
    }
}

impl std::fmt::Debug for RegistryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_ids_in_registration_order() {
        let manager = RegistryManager::standard();
        let ids: Vec<&str> = manager.ids().collect();
        assert_eq!(ids, ["order", "menus", "categories", "options", "option_groups"]);
    }

    #[test]
    fn test_reserved_and_duplicate_ids_rejected() {
        let mut manager = RegistryManager::standard();

        let all = manager.register(MenuRegistry::new("all"));
        assert!(matches!(all, Err(RegistryError::DuplicateRegistry(_))));

        let dup = manager.register(MenuRegistry::new("menus"));
        assert!(matches!(dup, Err(RegistryError::DuplicateRegistry(_))));
        assert_eq!(manager.len(), 5);
    }

    #[test]
    fn test_typed_and_erased_handles_share_storage() {
        let manager = RegistryManager::standard();
        let orders = manager.orders().expect("order registry");
        orders.upsert(Order {
            order_id: 5,
            customer: "c".into(),
            order_time: 0,
            status: Default::default(),
            cart: Default::default(),
        });

        let erased = manager.require("order").unwrap();
        assert_eq!(erased.len(), 1);
        assert!(erased.get_entity("5").is_some());
    }

    #[test]
    fn test_typed_with_wrong_type_is_none() {
        let manager = RegistryManager::standard();
        assert!(manager.typed::<Menu, ReplaceById>("order").is_none());
        assert!(manager.typed::<Menu, ReplaceById>("nope").is_none());
    }

    #[test]
    fn test_require_unknown_registry() {
        let manager = RegistryManager::standard();
        assert!(matches!(
            manager.require("tables"),
            Err(RegistryError::UnknownRegistry(id)) if id == "tables"
        ));
    }

    #[test]
    fn test_freeze_all() {
        let manager = RegistryManager::standard();
        manager.freeze_all();
        assert!(manager.iter().all(|r| r.is_frozen()));
    }
}
