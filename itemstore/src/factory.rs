//! Backend selection at startup
//!
//! [`build_repository`] is called once per process. It constructs the
//! backend named by `storage.backend`, brings it online (pool and schema for
//! the relational store, client and table for the table store) and wraps it
//! in [`Resilient`] with the configured per-call policy.

use std::sync::Arc;

use crate::config::{Config, StorageConfig};
use crate::error::{Error, Result};
use crate::model::Item;
use crate::relational::RelationalRepository;
use crate::repository::{Repository, Resilient};
use crate::table::TableRepository;

/// Shared handle to whichever backend the configuration selected
pub type ItemRepository = Arc<dyn Repository<Item>>;

/// Construct the configured backend and bring it online
///
/// # Errors
///
/// [`Error::RelationalInit`] when the relational pool or schema cannot be
/// brought up after the configured retries; [`Error::Storage`] (tagged
/// `table_client` or `create_table`) when the table store cannot be reached.
pub async fn build_repository(config: &Config) -> Result<ItemRepository> {
    let policy = config.resilience.policy();
    tracing::info!(
        backend = config.storage.backend_name(),
        timeout_secs = policy.operation_timeout.as_secs(),
        read_retry_attempts = policy.read_retry_attempts,
        "Building item repository"
    );

    let repository: ItemRepository = match &config.storage {
        StorageConfig::Relational(relational) => {
            let inner = RelationalRepository::connect(relational)
                .await
                .map_err(Error::RelationalInit)?;
            Arc::new(Resilient::new(inner, policy))
        }
        StorageConfig::TableStore(table) => {
            let inner = TableRepository::connect(table).await?;
            Arc::new(Resilient::new(inner, policy))
        }
    };

    tracing::info!(backend = repository.backend(), "Item repository ready");
    Ok(repository)
}
