//! Synchronized entity registries for kiosk sync.
//!
//! A node keeps every shared record (orders and the catalog) in registries:
//!
//! - [`Registry`]: one typed, lock-protected collection with identity
//!   tracking, dense raw indices, and a freeze flag
//! - [`MergePolicy`]: how a registry files and orders its entities
//!   ([`ReplaceById`], [`DescendingOrderId`])
//! - [`DynRegistry`]: the same registry with the entity type erased, for
//!   dispatch code that only has a registry id
//! - [`RegistryManager`]: the id → registry context object
//!
//! Registry operations are synchronous and never await; they are safe to
//! call from any task.

mod error;
mod manager;
mod policy;
mod registry;

pub use error::RegistryError;
pub use manager::{
    CategoryRegistry, MenuRegistry, OptionGroupRegistry, OptionRegistry, OrderRegistry,
    RegistryManager,
};
pub use policy::{DescendingOrderId, MergePolicy, ReplaceById};
pub use registry::{DynRegistry, Registry, Txn};
