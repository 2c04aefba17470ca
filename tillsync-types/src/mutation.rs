//! Locally originated writes awaiting delivery to the backend.

use crate::{Error, IdempotencyKey, Result, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The kind of write a queued mutation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateOrder,
    UpdateOrder,
    RecordPayment,
    AdjustStock,
    UpsertCatalogItem,
    DeleteCatalogItem,
}

impl MutationKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MutationKind::CreateOrder => "create_order",
            MutationKind::UpdateOrder => "update_order",
            MutationKind::RecordPayment => "record_payment",
            MutationKind::AdjustStock => "adjust_stock",
            MutationKind::UpsertCatalogItem => "upsert_catalog_item",
            MutationKind::DeleteCatalogItem => "delete_catalog_item",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create_order" => Ok(MutationKind::CreateOrder),
            "update_order" => Ok(MutationKind::UpdateOrder),
            "record_payment" => Ok(MutationKind::RecordPayment),
            "adjust_stock" => Ok(MutationKind::AdjustStock),
            "upsert_catalog_item" => Ok(MutationKind::UpsertCatalogItem),
            "delete_catalog_item" => Ok(MutationKind::DeleteCatalogItem),
            other => Err(Error::UnknownMutationKind(other.to_string())),
        }
    }
}

/// Delivery status of a queued mutation.
///
/// `Pending → Syncing → Succeeded` on success, `Pending → Syncing → Failed`
/// on failure. Only an explicit retry moves `Failed` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Failed,
    Succeeded,
}

impl MutationStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "PENDING",
            MutationStatus::Syncing => "SYNCING",
            MutationStatus::Failed => "FAILED",
            MutationStatus::Succeeded => "SUCCEEDED",
        }
    }

    /// Whether no further transition happens without outside intervention.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, MutationStatus::Succeeded)
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(MutationStatus::Pending),
            "SYNCING" => Ok(MutationStatus::Syncing),
            "FAILED" => Ok(MutationStatus::Failed),
            "SUCCEEDED" => Ok(MutationStatus::Succeeded),
            other => Err(Error::UnknownMutationStatus(other.to_string())),
        }
    }
}

/// A mutation as persisted in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Monotonically increasing local sequence number.
    pub local_id: i64,
    pub kind: MutationKind,
    /// Opaque to the outbox; interpreted by the backend.
    pub payload: Value,
    pub status: MutationStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub idempotency_key: IdempotencyKey,
}
