//! Replicated catalog entities.
//!
//! Every record carries the remote identifier, the remote-assigned
//! `updated_at` ordering key and a payload whose shape depends on the entity
//! type. Fields the replica does not interpret are kept verbatim in `extra`
//! so a record written back out is identical to what the backend sent.

use crate::{Error, RecordId, Result, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The closed set of catalog entity types kept in the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Category,
    Package,
    Table,
}

impl EntityType {
    /// All entity types, in the order a sync pass visits them.
    /// Categories go first so products never reference a category the
    /// replica has not seen yet on a clean install.
    pub const ALL: [EntityType; 4] = [
        EntityType::Category,
        EntityType::Product,
        EntityType::Package,
        EntityType::Table,
    ];

    /// Stable name used in storage keys, logs and remote URLs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Category => "category",
            EntityType::Package => "package",
            EntityType::Table => "table",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "product" => Ok(EntityType::Product),
            "category" => Ok(EntityType::Category),
            "package" => Ok(EntityType::Package),
            "table" => Ok(EntityType::Table),
            other => Err(Error::UnknownEntityType(other.to_string())),
        }
    }
}

/// Product fields the sync engine reasons about.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductPayload {
    #[serde(default)]
    pub name: String,
    /// Unit price as sent by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    /// Stock on hand as last reported by the backend. The backend is the
    /// sole authority; local adjustments are advisory until the next sync.
    #[serde(default)]
    pub current_stock: i64,
    /// `updated_at` of the remote row that last set `current_stock`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_synced_at: Option<Timestamp>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryPayload {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackagePayload {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TablePayload {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Type-specific record contents, tagged by entity type.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    Product(ProductPayload),
    Category(CategoryPayload),
    Package(PackagePayload),
    Table(TablePayload),
}

impl RecordPayload {
    /// The entity type this payload belongs to.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        match self {
            RecordPayload::Product(_) => EntityType::Product,
            RecordPayload::Category(_) => EntityType::Category,
            RecordPayload::Package(_) => EntityType::Package,
            RecordPayload::Table(_) => EntityType::Table,
        }
    }

    /// Decodes a payload object for the given entity type.
    pub fn from_json(entity_type: EntityType, value: Value) -> Result<Self> {
        Ok(match entity_type {
            EntityType::Product => RecordPayload::Product(serde_json::from_value(value)?),
            EntityType::Category => RecordPayload::Category(serde_json::from_value(value)?),
            EntityType::Package => RecordPayload::Package(serde_json::from_value(value)?),
            EntityType::Table => RecordPayload::Table(serde_json::from_value(value)?),
        })
    }

    /// Encodes the payload as a JSON object.
    pub fn to_json(&self) -> Result<Value> {
        Ok(match self {
            RecordPayload::Product(p) => serde_json::to_value(p)?,
            RecordPayload::Category(p) => serde_json::to_value(p)?,
            RecordPayload::Package(p) => serde_json::to_value(p)?,
            RecordPayload::Table(p) => serde_json::to_value(p)?,
        })
    }

    /// Display name shared by every entity type.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            RecordPayload::Product(p) => &p.name,
            RecordPayload::Category(p) => &p.name,
            RecordPayload::Package(p) => &p.name,
            RecordPayload::Table(p) => &p.name,
        }
    }
}

/// A catalog row as held in the local replica.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: RecordId,
    pub updated_at: Timestamp,
    pub payload: RecordPayload,
}

impl EntityRecord {
    /// Creates a record.
    pub fn new(id: impl Into<RecordId>, updated_at: Timestamp, payload: RecordPayload) -> Self {
        Self {
            id: id.into(),
            updated_at,
            payload,
        }
    }

    /// The entity type of this record.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    /// Returns the product payload, if this is a product.
    #[must_use]
    pub fn as_product(&self) -> Option<&ProductPayload> {
        match &self.payload {
            RecordPayload::Product(p) => Some(p),
            _ => None,
        }
    }

    /// Returns the product payload mutably, if this is a product.
    pub fn as_product_mut(&mut self) -> Option<&mut ProductPayload> {
        match &mut self.payload {
            RecordPayload::Product(p) => Some(p),
            _ => None,
        }
    }

    /// Decodes a flat remote row: `id`, `updated_at` and the payload fields
    /// side by side in one object. Numeric ids are accepted and stringified.
    pub fn from_json(entity_type: EntityType, value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::InvalidRecord(format!(
                "{entity_type} row is not a JSON object"
            )));
        };

        let id = match fields.remove("id") {
            Some(Value::String(s)) if !s.is_empty() => RecordId::new(s),
            Some(Value::Number(n)) => RecordId::new(n.to_string()),
            Some(other) => {
                return Err(Error::InvalidRecord(format!(
                    "{entity_type} row has invalid id: {other}"
                )));
            }
            None => {
                return Err(Error::InvalidRecord(format!("{entity_type} row has no id")));
            }
        };

        let updated_at = fields
            .remove("updated_at")
            .ok_or_else(|| Error::InvalidRecord(format!("{entity_type} row {id} has no updated_at")))?;
        let updated_at: Timestamp = serde_json::from_value(updated_at)?;

        let payload = RecordPayload::from_json(entity_type, Value::Object(fields))?;
        Ok(Self {
            id,
            updated_at,
            payload,
        })
    }

    /// Encodes the record as a flat object, the inverse of [`Self::from_json`].
    pub fn to_json(&self) -> Result<Value> {
        let mut fields = match self.payload.to_json()? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        fields.insert("id".into(), Value::String(self.id.to_string()));
        fields.insert("updated_at".into(), serde_json::to_value(self.updated_at)?);
        Ok(Value::Object(fields))
    }
}
