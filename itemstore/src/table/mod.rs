//! Table-store repository
//!
//! Items are flat property bags in a wide-column table, addressed by the
//! fixed `items` partition and a zero-padded row key. The store has no
//! auto-increment, so identifiers come from a sequence entity advanced with
//! ETag-conditioned writes.
//!
//! Updates read the current entity, compare versions, and replace it with
//! `If-Match` set to the ETag that read returned. A writer that lost a race
//! between the read and the write gets `ConflictVersion` instead of silently
//! overwriting the winner.
//!
//! Substring filters have no native equivalent; [`TablePlan`] sends what the
//! store can evaluate and the rest runs client-side after every page has
//! been fetched.

mod client;
mod codec;
mod http;
mod memory;
mod query;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use client::{
    Continuation, ETag, IfMatch, QueryPage, TableClient, TableEntity, TableError, PARTITION_KEY,
    ROW_KEY,
};
pub use codec::{decode, encode, row_key, ITEMS_PARTITION};
pub use http::HttpTableClient;
pub use memory::{InMemoryTableClient, MAX_PAGE_SIZE};
pub use query::{ClientSideFilter, Comparison, Literal, NativePredicate, TablePlan, TableQuery};

use crate::config::TableStoreConfig;
use crate::model::{now_utc, Item, ItemId};
use crate::repository::{
    DbError, DbErrorKind, DbOperation, DbResult, Filter, ItemPredicate, Pagination, Repository,
};

const SEQUENCE_PARTITION: &str = "__sequence";
const SEQUENCE_ROW: &str = "items";
const NEXT_ID: &str = "NextId";

/// Conditional writes attempted before allocation gives up under contention
const MAX_ALLOCATION_ATTEMPTS: u32 = 32;

/// [`Repository`] implementation over a [`TableClient`]
#[derive(Clone)]
pub struct TableRepository {
    client: Arc<dyn TableClient>,
}

impl std::fmt::Debug for TableRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRepository")
            .field("table", &self.client.table_name())
            .finish()
    }
}

impl TableRepository {
    /// Wrap a client without touching the store
    pub fn new(client: Arc<dyn TableClient>) -> Self {
        Self { client }
    }

    /// Build the HTTP client and create the table if absent
    pub async fn connect(config: &TableStoreConfig) -> DbResult<Self> {
        let client = HttpTableClient::new(config)
            .map_err(|e| map_table_error(DbOperation::TableClient, e))?;
        tracing::info!(
            backend = "table_store",
            url = %client.base_url(),
            table = %config.table_name,
            "Table client created"
        );

        let repository = Self::new(Arc::new(client));
        repository.ensure_table().await?;
        Ok(repository)
    }

    pub fn client(&self) -> &Arc<dyn TableClient> {
        &self.client
    }

    /// Create the table; an existing table counts as success
    pub async fn ensure_table(&self) -> DbResult<()> {
        match self.client.create_table().await {
            Ok(()) => {
                tracing::info!(backend = "table_store", table = self.client.table_name(), "Table created");
                Ok(())
            }
            Err(e) if e.is_table_exists() => {
                tracing::debug!(backend = "table_store", table = self.client.table_name(), "Table already exists");
                Ok(())
            }
            Err(e) => Err(map_table_error(DbOperation::CreateTable, e)),
        }
    }

    /// Take the next identifier from the sequence entity
    async fn allocate_id(&self) -> DbResult<ItemId> {
        let op = DbOperation::AllocateId;

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let outcome = match self.client.get_entity(SEQUENCE_PARTITION, SEQUENCE_ROW).await {
                Ok((entity, etag)) => {
                    let next = read_next_id(&entity)?;
                    let advanced = next.checked_add(1).ok_or_else(|| {
                        DbError::new(op, DbErrorKind::Opaque).with_detail("identifier space exhausted")
                    })?;
                    self.client
                        .replace_entity(sequence_entity(advanced), IfMatch::ETag(etag))
                        .await
                        .map(|_| next)
                }
                Err(e) if is_missing_entity(&e) => self
                    .client
                    .insert_entity(sequence_entity(2))
                    .await
                    .map(|_| 1),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(id) => return Ok(id),
                Err(e) if e.is_precondition_failed() || e.is_entity_exists() => {
                    tracing::debug!(backend = "table_store", attempt, "Sequence moved, retrying allocation");
                }
                Err(e) => return Err(map_table_error(op, e)),
            }
        }

        tracing::warn!(
            backend = "table_store",
            attempts = MAX_ALLOCATION_ATTEMPTS,
            "Identifier allocation gave up under contention"
        );
        Err(DbError::new(op, DbErrorKind::Opaque)
            .with_detail(format!(
                "sequence still contended after {} attempts",
                MAX_ALLOCATION_ATTEMPTS
            ))
            .transient())
    }
}

#[async_trait]
impl Repository<Item> for TableRepository {
    async fn create(&self, item: Item) -> DbResult<Item> {
        item.validate(DbOperation::Create)?;
        if item.id != 0 {
            return Err(DbError::validation(
                DbOperation::Create,
                "identifier must be unset on create",
            ));
        }

        let id = self.allocate_id().await?;
        let created = item.into_created(id, now_utc());
        self.client
            .insert_entity(encode(&created))
            .await
            .map_err(|e| map_table_error(DbOperation::Create, e))?;

        tracing::debug!(backend = "table_store", id, "Item created");
        Ok(created)
    }

    async fn find_by_id(&self, id: ItemId) -> DbResult<Item> {
        let (entity, _) = self
            .client
            .get_entity(ITEMS_PARTITION, &row_key(id))
            .await
            .map_err(|e| map_lookup_error(DbOperation::Find, id, e))?;
        decode(&entity)
    }

    async fn update(&self, item: Item) -> DbResult<Item> {
        let op = DbOperation::Update;
        item.validate(op)?;

        let (entity, etag) = self
            .client
            .get_entity(ITEMS_PARTITION, &row_key(item.id))
            .await
            .map_err(|e| map_lookup_error(op, item.id, e))?;
        let stored = decode(&entity)?;

        if stored.version != item.version {
            return Err(DbError::conflict(
                op,
                format!(
                    "item {} is at version {}, update expected {}",
                    item.id, stored.version, item.version
                ),
            ));
        }

        let updated = Item {
            version: stored.version + 1,
            created_at: stored.created_at,
            updated_at: now_utc(),
            ..item
        };
        self.client
            .replace_entity(encode(&updated), IfMatch::ETag(etag))
            .await
            .map_err(|e| {
                if e.is_precondition_failed() {
                    DbError::conflict(op, format!("item {} was modified concurrently", updated.id))
                        .with_source(e)
                } else {
                    map_lookup_error(op, updated.id, e)
                }
            })?;

        tracing::debug!(backend = "table_store", id = updated.id, version = updated.version, "Item updated");
        Ok(updated)
    }

    async fn delete(&self, id: ItemId) -> DbResult<()> {
        self.client
            .delete_entity(ITEMS_PARTITION, &row_key(id), IfMatch::Any)
            .await
            .map_err(|e| map_lookup_error(DbOperation::Delete, id, e))
    }

    async fn list(&self, filters: &[Filter], page: Option<Pagination>) -> DbResult<Vec<Item>> {
        let predicates = ItemPredicate::resolve_all(filters)?;
        let plan = TablePlan::build(ITEMS_PARTITION, &predicates);

        let mut items = Vec::new();
        let mut continuation: Option<Continuation> = None;
        let mut pages = 0_u32;
        loop {
            let result = self
                .client
                .query_entities(&plan.native, continuation.as_ref())
                .await
                .map_err(|e| map_table_error(DbOperation::List, e))?;
            pages += 1;

            for entity in &result.entities {
                let item = decode(entity)?;
                if plan.client_side.matches(&item) {
                    items.push(item);
                }
            }

            match result.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        tracing::debug!(
            backend = "table_store",
            pages,
            matched = items.len(),
            client_side = !plan.client_side.is_empty(),
            "Listed items"
        );
        Ok(match page {
            Some(page) => page.apply(items),
            None => items,
        })
    }

    async fn ping(&self) -> DbResult<()> {
        self.client
            .query_entities(&TableQuery::default().with_top(1), None)
            .await
            .map_err(|e| map_table_error(DbOperation::Ping, e))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "table_store"
    }
}

fn sequence_entity(next_id: ItemId) -> TableEntity {
    let mut entity = TableEntity::new();
    entity.insert(PARTITION_KEY.to_string(), Value::from(SEQUENCE_PARTITION));
    entity.insert(ROW_KEY.to_string(), Value::from(SEQUENCE_ROW));
    entity.insert(NEXT_ID.to_string(), Value::from(next_id.to_string()));
    entity.insert(format!("{}@odata.type", NEXT_ID), Value::from("Edm.Int64"));
    entity
}

fn read_next_id(entity: &TableEntity) -> DbResult<ItemId> {
    let parsed = match entity.get(NEXT_ID) {
        Some(Value::String(s)) => s.parse::<ItemId>().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        DbError::new(DbOperation::AllocateId, DbErrorKind::Opaque)
            .with_detail("sequence entity has no usable NextId")
    })
}

/// 404 for the entity itself, as opposed to a missing table
fn is_missing_entity(e: &TableError) -> bool {
    e.is_not_found() && e.code() != Some("TableNotFound")
}

fn map_lookup_error(operation: DbOperation, id: ItemId, e: TableError) -> DbError {
    if is_missing_entity(&e) {
        DbError::not_found(operation, format!("item {}", id))
    } else {
        map_table_error(operation, e)
    }
}

/// Classify a client failure by status and error code
fn map_table_error(operation: DbOperation, e: TableError) -> DbError {
    if e.is_entity_exists() {
        return DbError::duplicate_key(operation, e.to_string()).with_source(e);
    }
    if e.is_precondition_failed() {
        return DbError::conflict(operation, e.to_string()).with_source(e);
    }

    let transient = e.is_transient();
    tracing::debug!(backend = "table_store", %operation, error = %e, transient, "Table store call failed");
    let mapped = DbError::opaque(operation, e);
    if transient {
        mapped.transient()
    } else {
        mapped
    }
}
