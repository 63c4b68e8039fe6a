//! Repository error types
//!
//! Every failure leaving a repository is a [`DbError`]: an operation tag, one
//! of a small closed set of [`DbErrorKind`]s, a message, and (when a backend
//! produced one) the underlying cause, reachable through
//! [`std::error::Error::source`].
//!
//! # Example
//!
//! ```rust
//! use itemstore::repository::{DbError, DbErrorKind, DbOperation};
//!
//! let error = DbError::not_found(DbOperation::Find, "item 42");
//! assert_eq!(error.kind(), DbErrorKind::NotFound);
//! assert_eq!(error.to_string(), "find: record not found (item 42)");
//! ```

use std::error::Error as StdError;
use std::fmt;

/// Boxed cause carried inside a [`DbError`]
pub type BoxedCause = Box<dyn StdError + Send + Sync + 'static>;

/// Operation being performed when the error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbOperation {
    /// Creating a new record
    Create,
    /// Point lookup by identifier
    Find,
    /// Overwriting an existing record
    Update,
    /// Removing a record
    Delete,
    /// Filtered, paginated listing
    List,
    /// Reachability probe
    Ping,
    /// Establishing the relational connection pool
    Connect,
    /// Constructing the table-store client
    TableClient,
    /// Creating the backing table or collection
    CreateTable,
    /// Allocating a new identifier
    AllocateId,
    /// Turning stored data back into an entity
    Decode,
}

impl fmt::Display for DbOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Find => write!(f, "find"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::List => write!(f, "list"),
            Self::Ping => write!(f, "ping"),
            Self::Connect => write!(f, "connect"),
            Self::TableClient => write!(f, "table_client"),
            Self::CreateTable => write!(f, "create_table"),
            Self::AllocateId => write!(f, "allocate_id"),
            Self::Decode => write!(f, "decode"),
        }
    }
}

/// Canonical category of a repository error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    /// The addressed record does not exist
    NotFound,
    /// A record with the same key already exists
    DuplicateKey,
    /// The entity or query failed structural validation
    ValidationFailed,
    /// The backend could not be reached, or the call timed out
    ConnectionFailed,
    /// The caller's version no longer matches the stored version
    ConflictVersion,
    /// Any other backend failure; inspect the source for details
    Opaque,
}

impl DbErrorKind {
    fn describe(self) -> &'static str {
        match self {
            Self::NotFound => "record not found",
            Self::DuplicateKey => "duplicate key violation",
            Self::ValidationFailed => "validation error",
            Self::ConnectionFailed => "database connection failed",
            Self::ConflictVersion => "version conflict",
            Self::Opaque => "backend error",
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::DuplicateKey => write!(f, "duplicate_key"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::ConflictVersion => write!(f, "conflict_version"),
            Self::Opaque => write!(f, "opaque"),
        }
    }
}

/// Structured repository error with operation context
///
/// Display renders as `"{operation}: {description}"`, followed by the detail
/// message or the cause when either is present.
#[derive(Debug)]
pub struct DbError {
    operation: DbOperation,
    kind: DbErrorKind,
    detail: Option<String>,
    transient: bool,
    source: Option<BoxedCause>,
}

impl DbError {
    /// Create a new error with no underlying cause
    pub fn new(operation: DbOperation, kind: DbErrorKind) -> Self {
        Self {
            operation,
            kind,
            detail: None,
            transient: false,
            source: None,
        }
    }

    /// Wrap a backend cause as an [`DbErrorKind::Opaque`] error
    pub fn opaque(operation: DbOperation, cause: impl Into<BoxedCause>) -> Self {
        Self::new(operation, DbErrorKind::Opaque).with_source(cause)
    }

    pub fn not_found(operation: DbOperation, detail: impl Into<String>) -> Self {
        Self::new(operation, DbErrorKind::NotFound).with_detail(detail)
    }

    pub fn duplicate_key(operation: DbOperation, detail: impl Into<String>) -> Self {
        Self::new(operation, DbErrorKind::DuplicateKey).with_detail(detail)
    }

    pub fn validation(operation: DbOperation, detail: impl Into<String>) -> Self {
        Self::new(operation, DbErrorKind::ValidationFailed).with_detail(detail)
    }

    pub fn connection_failed(operation: DbOperation, cause: impl Into<BoxedCause>) -> Self {
        Self::new(operation, DbErrorKind::ConnectionFailed).with_source(cause)
    }

    /// Stale-version rejection, produced by the caller layer or by a
    /// conditional write that lost a race
    pub fn conflict(operation: DbOperation, detail: impl Into<String>) -> Self {
        Self::new(operation, DbErrorKind::ConflictVersion).with_detail(detail)
    }

    /// Attach a human-readable detail message
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach the underlying cause
    #[must_use]
    pub fn with_source(mut self, cause: impl Into<BoxedCause>) -> Self {
        self.source = Some(cause.into());
        self
    }

    /// Mark an opaque error as safe to retry for idempotent operations
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Re-tag the error with a different operation
    #[must_use]
    pub fn with_operation(mut self, operation: DbOperation) -> Self {
        self.operation = operation;
        self
    }

    pub fn operation(&self) -> DbOperation {
        self.operation
    }

    /// The canonical kind this error unwraps to
    pub fn kind(&self) -> DbErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == DbErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == DbErrorKind::ConflictVersion
    }

    /// Whether an idempotent operation may be retried after this error
    ///
    /// ```rust
    /// use itemstore::repository::{DbError, DbOperation};
    ///
    /// let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
    /// assert!(DbError::connection_failed(DbOperation::Ping, refused).is_retriable());
    /// assert!(!DbError::not_found(DbOperation::Find, "item 1").is_retriable());
    /// ```
    pub fn is_retriable(&self) -> bool {
        match self.kind {
            DbErrorKind::ConnectionFailed => true,
            DbErrorKind::Opaque => self.transient,
            _ => false,
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.operation)?;
        match (&self.detail, &self.source) {
            (Some(detail), _) if self.kind == DbErrorKind::Opaque => write!(f, "{}", detail),
            (Some(detail), _) => write!(f, "{} ({})", self.kind.describe(), detail),
            (None, Some(source)) if self.kind == DbErrorKind::Opaque => write!(f, "{}", source),
            (None, Some(source)) => write!(f, "{}: {}", self.kind.describe(), source),
            (None, None) => write!(f, "{}", self.kind.describe()),
        }
    }
}

impl StdError for DbError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn StdError + 'static))
    }
}

/// Result type for repository operations
pub type DbResult<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_tags() {
        assert_eq!(DbOperation::Create.to_string(), "create");
        assert_eq!(DbOperation::Find.to_string(), "find");
        assert_eq!(DbOperation::Update.to_string(), "update");
        assert_eq!(DbOperation::List.to_string(), "list");
        assert_eq!(DbOperation::Ping.to_string(), "ping");
        assert_eq!(DbOperation::TableClient.to_string(), "table_client");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(DbErrorKind::NotFound.to_string(), "not_found");
        assert_eq!(DbErrorKind::DuplicateKey.to_string(), "duplicate_key");
        assert_eq!(DbErrorKind::ConflictVersion.to_string(), "conflict_version");
    }

    #[test]
    fn test_display_with_detail() {
        let error = DbError::duplicate_key(DbOperation::Create, "row 00000000000000000007");
        assert_eq!(
            error.to_string(),
            "create: duplicate key violation (row 00000000000000000007)"
        );
    }

    #[test]
    fn test_opaque_displays_cause() {
        let cause = std::io::Error::other("socket closed");
        let error = DbError::opaque(DbOperation::List, cause);
        assert_eq!(error.kind(), DbErrorKind::Opaque);
        assert_eq!(error.to_string(), "list: socket closed");
    }

    #[test]
    fn test_source_is_unwrappable() {
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = DbError::connection_failed(DbOperation::Ping, cause);

        let source = error.source().expect("source should be kept");
        let io = source
            .downcast_ref::<std::io::Error>()
            .expect("source should be the io error");
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_retriable() {
        assert!(DbError::opaque(DbOperation::Find, "503").transient().is_retriable());
        assert!(!DbError::opaque(DbOperation::Find, "bad request").is_retriable());
        assert!(!DbError::conflict(DbOperation::Update, "stale").is_retriable());
        assert!(!DbError::validation(DbOperation::Create, "empty name").is_retriable());
    }

    #[test]
    fn test_with_operation_retags() {
        let error = DbError::not_found(DbOperation::Find, "item 3").with_operation(DbOperation::Update);
        assert_eq!(error.operation(), DbOperation::Update);
        assert!(error.is_not_found());
    }
}
