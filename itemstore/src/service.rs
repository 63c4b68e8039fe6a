//! Caller-side item operations
//!
//! [`ItemService`] is what a request handler talks to. It validates input
//! before any backend call and enforces the version check of optimistic
//! concurrency: an update carrying a stale version is rejected with
//! `ConflictVersion` without issuing a write. Both backends repeat the check
//! as a conditional write, so two callers that pass this check at the same
//! time still cannot both succeed.

use std::sync::Arc;

use crate::model::{Item, ItemId, ItemUpdate, NewItem};
use crate::repository::{DbError, DbOperation, DbResult, Filter, Pagination, Repository};

/// Item operations on top of any [`Repository<Item>`]
#[derive(Clone)]
pub struct ItemService {
    repository: Arc<dyn Repository<Item>>,
}

impl ItemService {
    pub fn new(repository: Arc<dyn Repository<Item>>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<dyn Repository<Item>> {
        &self.repository
    }

    pub async fn create(&self, new: NewItem) -> DbResult<Item> {
        let item = Item::from(new);
        item.validate(DbOperation::Create)?;
        self.repository.create(item).await
    }

    pub async fn get(&self, id: ItemId) -> DbResult<Item> {
        self.repository.find_by_id(id).await
    }

    /// Replace name and price if the caller saw the current version
    ///
    /// # Errors
    ///
    /// `NotFound` when the item does not exist, `ConflictVersion` when
    /// `change.version` is not the stored version (nothing is written), or
    /// when another writer got in between the check and the write.
    pub async fn update(&self, id: ItemId, change: ItemUpdate) -> DbResult<Item> {
        let current = self.repository.find_by_id(id).await.map_err(|e| {
            if e.is_not_found() {
                e.with_operation(DbOperation::Update)
            } else {
                e
            }
        })?;

        if current.version != change.version {
            tracing::debug!(
                id,
                stored = current.version,
                supplied = change.version,
                "Rejecting update with stale version"
            );
            return Err(DbError::conflict(
                DbOperation::Update,
                format!(
                    "item {} is at version {}, update supplied {}",
                    id, current.version, change.version
                ),
            ));
        }

        let item = Item {
            name: change.name,
            price: change.price,
            ..current
        };
        item.validate(DbOperation::Update)?;
        self.repository.update(item).await
    }

    pub async fn delete(&self, id: ItemId) -> DbResult<()> {
        self.repository.delete(id).await
    }

    pub async fn list(&self, filters: &[Filter], page: Option<Pagination>) -> DbResult<Vec<Item>> {
        self.repository.list(filters, page).await
    }

    pub async fn ping(&self) -> DbResult<()> {
        self.repository.ping().await
    }
}
