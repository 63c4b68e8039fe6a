//! The item entity and its input shapes

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::repository::{DbError, DbOperation, DbResult};

/// Identifier of a stored item
///
/// `0` is reserved for an item that has not been created yet.
pub type ItemId = u64;

/// A catalog item as stored by either backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Assigned on create, immutable afterwards
    #[serde(default)]
    pub id: ItemId,
    pub name: String,
    pub price: f64,
    /// Starts at 0 and increases by exactly one per successful update
    #[serde(default)]
    pub version: u64,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Item {
    /// An unsaved item with the given caller-supplied fields
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            price,
            version: 0,
            created_at: epoch(),
            updated_at: epoch(),
            deleted_at: None,
        }
    }

    /// Structural validation applied before any backend call
    pub fn validate(&self, operation: DbOperation) -> DbResult<()> {
        if self.name.trim().is_empty() {
            return Err(DbError::validation(operation, "item name cannot be empty"));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(DbError::validation(
                operation,
                "price must be a non-negative number",
            ));
        }
        Ok(())
    }

    /// Stamp identifier, timestamps and the initial version after an insert
    pub(crate) fn into_created(mut self, id: ItemId, now: DateTime<Utc>) -> Self {
        self.id = id;
        self.version = 0;
        self.created_at = now;
        self.updated_at = now;
        self
    }
}

/// Caller-supplied fields for a new item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub price: f64,
}

impl From<NewItem> for Item {
    fn from(new: NewItem) -> Self {
        Item::new(new.name, new.price)
    }
}

/// Replacement fields plus the version the caller last observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub name: String,
    pub price: f64,
    pub version: u64,
}

/// Current UTC time at the precision both backends store
pub(crate) fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
