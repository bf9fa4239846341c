use shared::{EntityId, NackReason};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tick rate must be between 1 and 1000 Hz, got {0}")]
    TickRate(u32),
    #[error("AOI tiers must be non-empty with strictly increasing radii and refresh >= 1")]
    AoiTiers,
    #[error("zone bounds are empty or exceed the world extent")]
    ZoneBounds,
    #[error("no class caps configured")]
    NoClasses,
    #[error("movement tolerance {tolerance_pct}% must stay below the reject multiple {reject_multiple_pct}%")]
    MovementThresholds {
        tolerance_pct: u32,
        reject_multiple_pct: u32,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("entity {0} not found")]
    NotFound(EntityId),
    #[error("entity {0} already exists")]
    Duplicate(EntityId),
    #[error("entity {0} is a mirror and cannot be mutated locally")]
    Mirrored(EntityId),
}

/// Reasons a destination refuses a migration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("snapshot position for {0} lies outside the destination bounds")]
    OutOfBounds(EntityId),
    #[error("entity {0} is already owned here")]
    DuplicateEntity(EntityId),
    #[error("snapshot for {0} is malformed")]
    Malformed(EntityId),
    #[error("ticket for {0} is addressed to another zone")]
    WrongDestination(EntityId),
}

impl MigrationError {
    pub fn nack_reason(&self) -> NackReason {
        match self {
            MigrationError::OutOfBounds(_) => NackReason::OutOfBounds,
            MigrationError::DuplicateEntity(_) => NackReason::DuplicateEntity,
            MigrationError::Malformed(_) => NackReason::Malformed,
            MigrationError::WrongDestination(_) => NackReason::WrongDestination,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
