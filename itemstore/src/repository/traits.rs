//! Repository trait definition
//!
//! [`Repository`] is the uniform contract both storage backends implement.
//! It is parameterized by the entity type, so a repository can only ever
//! hand back the entity it was built for.
//!
//! The trait uses `async_trait` rather than RPITIT so that the factory can
//! return `Arc<dyn Repository<Item>>`.

use async_trait::async_trait;

use super::error::DbResult;
use super::query::{Filter, Pagination};
use crate::model::ItemId;

/// CRUD, listing and reachability for a single entity type
///
/// # Example
///
/// ```rust,ignore
/// use itemstore::repository::{Filter, Pagination, Repository};
///
/// let created = repo.create(Item::new("Phone", 499.0)).await?;
/// let phones = repo
///     .list(&[Filter::contains("name", "phone")], Some(Pagination::new(10, 0)))
///     .await?;
/// ```
#[async_trait]
pub trait Repository<E>: Send + Sync
where
    E: Send + 'static,
{
    /// Insert a new entity
    ///
    /// The entity's identifier must be unset. The returned entity carries the
    /// assigned identifier, both timestamps and version `0`.
    ///
    /// # Errors
    ///
    /// `ValidationFailed` for a structurally invalid entity, `DuplicateKey`
    /// when a record with the resulting key already exists.
    async fn create(&self, entity: E) -> DbResult<E>;

    /// Point lookup by identifier
    ///
    /// # Errors
    ///
    /// `NotFound` when no record has this identifier.
    async fn find_by_id(&self, id: ItemId) -> DbResult<E>;

    /// Overwrite the stored fields of an existing entity
    ///
    /// The entity's `version` must equal the stored version. On success the
    /// stored version is incremented by one and `updated_at` refreshed.
    ///
    /// # Errors
    ///
    /// `NotFound` when the identifier does not exist, `ConflictVersion` when
    /// the stored version moved on.
    async fn update(&self, entity: E) -> DbResult<E>;

    /// Permanently remove a record
    ///
    /// # Errors
    ///
    /// `NotFound` when the identifier does not exist.
    async fn delete(&self, id: ItemId) -> DbResult<()>;

    /// AND-combined filters, then pagination, in identifier order
    ///
    /// An empty result is not an error.
    async fn list(&self, filters: &[Filter], page: Option<Pagination>) -> DbResult<Vec<E>>;

    /// Minimal non-mutating round trip to the backend
    async fn ping(&self) -> DbResult<()>;

    /// Short backend name used in logs and health output
    fn backend(&self) -> &'static str;
}
