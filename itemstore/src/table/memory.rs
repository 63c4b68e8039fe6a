//! In-process table store
//!
//! [`InMemoryTableClient`] behaves like the real service where the
//! repository can observe it: entities ordered by partition then row key,
//! a fresh ETag on every write, `If-Match` preconditions, server-side
//! evaluation of native predicates and paging with continuation tokens.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::client::{
    entity_keys, Continuation, ETag, IfMatch, QueryPage, TableClient, TableEntity, TableError,
    ENTITY_ALREADY_EXISTS, TABLE_ALREADY_EXISTS,
};
use super::query::TableQuery;

/// Largest page the service returns for one query
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug)]
struct StoredEntity {
    properties: TableEntity,
    etag: ETag,
}

#[derive(Debug, Default)]
struct State {
    table_exists: bool,
    unavailable: bool,
    last_etag: u64,
    rows: BTreeMap<(String, String), StoredEntity>,
}

impl State {
    fn next_etag(&mut self) -> ETag {
        self.last_etag += 1;
        ETag::new(format!("W/\"{}\"", self.last_etag))
    }

    fn check_available(&self) -> Result<(), TableError> {
        if self.unavailable {
            return Err(TableError::response(
                503,
                Some("ServerBusy".to_string()),
                "The server is currently unable to receive requests.",
            ));
        }
        if !self.table_exists {
            return Err(TableError::response(
                404,
                Some("TableNotFound".to_string()),
                "The table specified does not exist.",
            ));
        }
        Ok(())
    }
}

fn resource_not_found() -> TableError {
    TableError::response(
        404,
        Some("ResourceNotFound".to_string()),
        "The specified resource does not exist.",
    )
}

fn condition_not_met() -> TableError {
    TableError::response(
        412,
        Some("UpdateConditionNotSatisfied".to_string()),
        "The update condition specified in the request was not satisfied.",
    )
}

/// [`TableClient`] keeping one table in memory
#[derive(Debug)]
pub struct InMemoryTableClient {
    table_name: String,
    page_size: usize,
    state: Mutex<State>,
}

impl InMemoryTableClient {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            page_size: MAX_PAGE_SIZE,
            state: Mutex::new(State::default()),
        }
    }

    /// Return at most `page_size` entities per query page
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Answer every call with 503 until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of stored entities across all partitions
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TableClient for InMemoryTableClient {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn create_table(&self) -> Result<(), TableError> {
        let mut state = self.lock();
        if state.unavailable {
            state.check_available()?;
        }
        if state.table_exists {
            return Err(TableError::response(
                409,
                Some(TABLE_ALREADY_EXISTS.to_string()),
                "The table specified already exists.",
            ));
        }
        state.table_exists = true;
        Ok(())
    }

    async fn insert_entity(&self, entity: TableEntity) -> Result<ETag, TableError> {
        let key = entity_keys(&entity)?;
        let mut state = self.lock();
        state.check_available()?;

        if state.rows.contains_key(&key) {
            return Err(TableError::response(
                409,
                Some(ENTITY_ALREADY_EXISTS.to_string()),
                "The specified entity already exists.",
            ));
        }
        let etag = state.next_etag();
        state.rows.insert(
            key,
            StoredEntity {
                properties: entity,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<(TableEntity, ETag), TableError> {
        let state = self.lock();
        state.check_available()?;

        state
            .rows
            .get(&(partition_key.to_string(), row_key.to_string()))
            .map(|stored| (stored.properties.clone(), stored.etag.clone()))
            .ok_or_else(resource_not_found)
    }

    async fn replace_entity(
        &self,
        entity: TableEntity,
        if_match: IfMatch,
    ) -> Result<ETag, TableError> {
        let key = entity_keys(&entity)?;
        let mut state = self.lock();
        state.check_available()?;

        let current = state.rows.get(&key).ok_or_else(resource_not_found)?;
        if !if_match.allows(&current.etag) {
            return Err(condition_not_met());
        }
        let etag = state.next_etag();
        state.rows.insert(
            key,
            StoredEntity {
                properties: entity,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
        if_match: IfMatch,
    ) -> Result<(), TableError> {
        let key = (partition_key.to_string(), row_key.to_string());
        let mut state = self.lock();
        state.check_available()?;

        let current = state.rows.get(&key).ok_or_else(resource_not_found)?;
        if !if_match.allows(&current.etag) {
            return Err(condition_not_met());
        }
        state.rows.remove(&key);
        Ok(())
    }

    async fn query_entities(
        &self,
        query: &TableQuery,
        continuation: Option<&Continuation>,
    ) -> Result<QueryPage, TableError> {
        let state = self.lock();
        state.check_available()?;

        let limit = query
            .top
            .map_or(self.page_size, |top| (top as usize).clamp(1, self.page_size));
        let start = continuation
            .map(|c| {
                (
                    c.next_partition_key.clone(),
                    c.next_row_key.clone().unwrap_or_default(),
                )
            })
            .unwrap_or_default();

        let mut page = QueryPage::default();
        for ((partition_key, row_key), stored) in state.rows.range(start..) {
            if page.entities.len() == limit {
                page.continuation = Some(Continuation {
                    next_partition_key: partition_key.clone(),
                    next_row_key: Some(row_key.clone()),
                });
                break;
            }
            if query.matches(&stored.properties) {
                page.entities.push(stored.properties.clone());
            }
        }
        Ok(page)
    }
}
