//! Crate-level error type for configuration and startup

use thiserror::Error;

use crate::repository::DbError;

/// Errors raised while loading configuration or bringing a backend online
///
/// Per-call repository failures are [`DbError`]s; they only appear here when
/// a startup step (or the CLI) surfaces them.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration loaded but failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Relational pool bring-up or schema creation failed
    #[error("failed to initialize relational database: {0}")]
    RelationalInit(#[source] DbError),

    /// A storage operation failed
    #[error("{0}")]
    Storage(#[from] DbError),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl Error {
    /// The repository error underneath, if any
    pub fn as_db_error(&self) -> Option<&DbError> {
        match self {
            Error::RelationalInit(e) | Error::Storage(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{DbErrorKind, DbOperation};

    #[test]
    fn test_relational_init_display() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::RelationalInit(DbError::connection_failed(DbOperation::Connect, refused));
        assert_eq!(
            err.to_string(),
            "failed to initialize relational database: connect: database connection failed: refused"
        );
        assert_eq!(
            err.as_db_error().map(DbError::kind),
            Some(DbErrorKind::ConnectionFailed)
        );
    }

    #[test]
    fn test_storage_is_transparent() {
        let err: Error = DbError::not_found(DbOperation::Find, "item 9").into();
        assert_eq!(err.to_string(), "find: record not found (item 9)");
    }
}
