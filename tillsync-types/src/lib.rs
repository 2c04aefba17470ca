//! Core type definitions for tillsync.
//!
//! This crate defines the types shared by the replica store, the sync engine
//! and the mutation outbox:
//! - The closed set of replicated catalog entity types
//! - Catalog records with a typed payload per entity type
//! - Remote-assigned millisecond timestamps used as the ordering key
//! - Queued mutations and their delivery status
//!
//! Nothing here performs I/O.

mod entity;
mod ids;
mod mutation;
mod timestamp;

pub use entity::{
    CategoryPayload, EntityRecord, EntityType, PackagePayload, ProductPayload, RecordPayload,
    TablePayload,
};
pub use ids::{IdempotencyKey, RecordId};
pub use mutation::{MutationKind, MutationStatus, QueuedMutation};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("unknown mutation kind: {0}")]
    UnknownMutationKind(String),

    #[error("unknown mutation status: {0}")]
    UnknownMutationStatus(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
