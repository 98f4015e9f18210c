//! Error types for the registry layer.

use kiosk_protocol::EntityKind;

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A mutation was attempted while the registry was frozen. Nothing was
    /// changed.
    #[error("registry {registry_id} is frozen")]
    Frozen { registry_id: String },

    /// An entity of the wrong kind was offered to a typed registry.
    #[error("registry {registry_id} holds {expected}, got {found}")]
    TypeMismatch {
        registry_id: String,
        expected: EntityKind,
        found: EntityKind,
    },

    /// No registry is registered under this id.
    #[error("unknown registry: {0}")]
    UnknownRegistry(String),

    /// A registry id was registered twice, or the reserved id was used.
    #[error("registry id already taken: {0}")]
    DuplicateRegistry(String),
}
