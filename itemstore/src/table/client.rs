//! Table-store client seam
//!
//! [`TableClient`] is the narrow set of calls the table repository needs from
//! a wide-column store: point reads and writes addressed by partition and row
//! key, ETag-conditioned replace and delete, and paged queries. Each client is
//! bound to one table.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use super::query::TableQuery;
use crate::repository::BoxedCause;

/// Property name of the partition key
pub const PARTITION_KEY: &str = "PartitionKey";
/// Property name of the row key
pub const ROW_KEY: &str = "RowKey";

/// Error code returned when inserting an entity whose key is taken
pub const ENTITY_ALREADY_EXISTS: &str = "EntityAlreadyExists";
/// Error code returned when creating a table that exists
pub const TABLE_ALREADY_EXISTS: &str = "TableAlreadyExists";

/// A stored record: a flat bag of named JSON properties
///
/// Typed properties carry an `<name>@odata.type` annotation next to them.
pub type TableEntity = serde_json::Map<String, serde_json::Value>;

/// Opaque entity version token issued by the store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ETag(String);

impl ETag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precondition for replace and delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfMatch {
    /// Apply regardless of the stored version
    Any,
    /// Apply only while the stored entity still carries this ETag
    ETag(ETag),
}

impl IfMatch {
    /// Value of the `If-Match` request header
    pub fn header_value(&self) -> &str {
        match self {
            IfMatch::Any => "*",
            IfMatch::ETag(etag) => etag.as_str(),
        }
    }

    pub fn allows(&self, current: &ETag) -> bool {
        match self {
            IfMatch::Any => true,
            IfMatch::ETag(expected) => expected == current,
        }
    }
}

/// Where the next page of a query starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub next_partition_key: String,
    pub next_row_key: Option<String>,
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub entities: Vec<TableEntity>,
    /// Present while more pages remain
    pub continuation: Option<Continuation>,
}

/// Failure reported by a [`TableClient`]
///
/// Carries the HTTP status and the store's error code when the store
/// answered, or only a message and cause when it could not be reached.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TableError {
    status: Option<u16>,
    code: Option<String>,
    message: String,
    transient: bool,
    #[source]
    source: Option<BoxedCause>,
}

impl TableError {
    /// The store answered with a non-success status
    pub fn response(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = match &code {
            Some(code) => format!("{} {}: {}", status, code, message),
            None => format!("{}: {}", status, message),
        };
        Self {
            status: Some(status),
            code,
            message,
            transient: status >= 500 || status == 408 || status == 429,
            source: None,
        }
    }

    /// The request never produced a response
    pub fn transport(cause: impl Into<BoxedCause>) -> Self {
        let cause = cause.into();
        Self {
            status: None,
            code: None,
            message: format!("request failed: {}", cause),
            transient: true,
            source: Some(cause),
        }
    }

    /// A local failure: bad settings, malformed payload, missing header
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            transient: false,
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, cause: impl Into<BoxedCause>) -> Self {
        self.source = Some(cause.into());
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn is_entity_exists(&self) -> bool {
        self.status == Some(409) && self.code() != Some(TABLE_ALREADY_EXISTS)
    }

    pub fn is_table_exists(&self) -> bool {
        self.status == Some(409) && self.code() == Some(TABLE_ALREADY_EXISTS)
    }

    /// An `If-Match` precondition did not hold
    pub fn is_precondition_failed(&self) -> bool {
        self.status == Some(412)
    }

    /// Worth retrying: unreachable, throttled or a server-side fault
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Calls the table repository makes against a wide-column store
#[async_trait]
pub trait TableClient: Send + Sync {
    /// Name of the table this client addresses
    fn table_name(&self) -> &str;

    /// Create the table; fails with `TableAlreadyExists` when present
    async fn create_table(&self) -> Result<(), TableError>;

    /// Insert a new entity; fails with `EntityAlreadyExists` (409) on a taken key
    async fn insert_entity(&self, entity: TableEntity) -> Result<ETag, TableError>;

    /// Point read; fails with 404 when absent
    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<(TableEntity, ETag), TableError>;

    /// Replace every property of an existing entity
    ///
    /// Fails with 404 when absent and 412 when `if_match` does not hold.
    async fn replace_entity(&self, entity: TableEntity, if_match: IfMatch)
        -> Result<ETag, TableError>;

    /// Remove an entity; same failure statuses as replace
    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
        if_match: IfMatch,
    ) -> Result<(), TableError>;

    /// Fetch one page of entities matching `query`
    async fn query_entities(
        &self,
        query: &TableQuery,
        continuation: Option<&Continuation>,
    ) -> Result<QueryPage, TableError>;
}

/// Partition and row key of an entity about to be written
pub(crate) fn entity_keys(entity: &TableEntity) -> Result<(String, String), TableError> {
    let key = |name: &str| {
        entity
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| TableError::other(format!("entity is missing {}", name)))
    };
    Ok((key(PARTITION_KEY)?, key(ROW_KEY)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_classification() {
        let missing = TableError::response(404, Some("ResourceNotFound".into()), "gone");
        assert!(missing.is_not_found());
        assert!(!missing.is_transient());
        assert_eq!(missing.to_string(), "404 ResourceNotFound: gone");

        let exists = TableError::response(409, Some(ENTITY_ALREADY_EXISTS.into()), "taken");
        assert!(exists.is_entity_exists());
        assert!(!exists.is_table_exists());

        let table = TableError::response(409, Some(TABLE_ALREADY_EXISTS.into()), "exists");
        assert!(table.is_table_exists());

        assert!(TableError::response(412, None, "stale").is_precondition_failed());
        assert!(TableError::response(503, Some("ServerBusy".into()), "busy").is_transient());
        assert!(TableError::response(429, None, "slow down").is_transient());
    }

    #[test]
    fn test_transport_is_transient() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TableError::transport(refused);
        assert!(err.is_transient());
        assert_eq!(err.status(), None);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_if_match() {
        let current = ETag::new("W/\"3\"");
        assert!(IfMatch::Any.allows(&current));
        assert!(IfMatch::ETag(current.clone()).allows(&current));
        assert!(!IfMatch::ETag(ETag::new("W/\"2\"")).allows(&current));
        assert_eq!(IfMatch::Any.header_value(), "*");
    }

    #[test]
    fn test_entity_keys() {
        let mut entity = TableEntity::new();
        entity.insert(PARTITION_KEY.into(), "items".into());
        assert!(entity_keys(&entity).is_err());

        entity.insert(ROW_KEY.into(), "00000000000000000001".into());
        let (pk, rk) = entity_keys(&entity).unwrap();
        assert_eq!(pk, "items");
        assert_eq!(rk, "00000000000000000001");
    }
}
