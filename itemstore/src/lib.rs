//! # itemstore
//!
//! One repository contract for catalog items over two storage backends: a
//! relational database (MySQL in production, SQLite for tests) and a
//! wide-column table store spoken to over REST.
//!
//! ## Features
//!
//! - **Uniform contract**: [`repository::Repository`] with create, find,
//!   update, delete, list and ping, identical across backends
//! - **Error taxonomy**: every failure is a [`repository::DbError`] with an
//!   operation tag and a canonical kind
//! - **Query model**: AND-combined filters and limit/offset pagination,
//!   translated to SQL or to native table queries plus a client-side fallback
//! - **Optimistic concurrency**: version counters checked by the caller and
//!   enforced again by a conditional write in each backend
//! - **Resilience**: per-call timeouts and idempotent read retry
//! - **Health checks**: liveness and readiness reports
//!
//! ## Example
//!
//! ```rust,no_run
//! use itemstore::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!     init_tracing(&config)?;
//!
//!     let service = ItemService::new(build_repository(&config).await?);
//!     let item = service
//!         .create(NewItem { name: "Phone".into(), price: 499.0 })
//!         .await?;
//!
//!     let phones = service
//!         .list(&[Filter::contains("name", "phone")], Some(Pagination::new(10, 0)))
//!         .await?;
//!     assert_eq!(phones[0].id, item.id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod health;
pub mod model;
pub mod observability;
pub mod relational;
pub mod repository;
pub mod service;
pub mod table;

/// Common imports
pub mod prelude {
    pub use crate::config::{
        Config, RelationalConfig, RelationalDriver, ResilienceConfig, ServiceConfig,
        StorageConfig, TableStoreConfig,
    };
    pub use crate::error::{Error, Result};
    pub use crate::factory::{build_repository, ItemRepository};
    pub use crate::health::{HealthCheck, HealthChecker, HealthStatus, RepositoryCheck, Status};
    pub use crate::model::{Item, ItemId, ItemUpdate, NewItem};
    pub use crate::observability::init_tracing;
    pub use crate::relational::RelationalRepository;
    pub use crate::repository::{
        DbError, DbErrorKind, DbOperation, DbResult, Filter, FilterOperator, FilterValue,
        Pagination, Repository, ResiliencePolicy, Resilient,
    };
    pub use crate::service::ItemService;
    pub use crate::table::{HttpTableClient, TableClient, TableRepository};
}

/// Behaviour every backend must share, run against each of them
#[cfg(test)]
mod contract {
    use std::sync::Arc;

    use crate::model::Item;
    use crate::repository::{DbErrorKind, Filter, Pagination, Repository, ResiliencePolicy, Resilient};
    use crate::{relational, table};

    async fn backends() -> Vec<Arc<dyn Repository<Item>>> {
        let sql: Arc<dyn Repository<Item>> = Arc::new(relational::tests::memory_repository().await);
        let wide: Arc<dyn Repository<Item>> = Arc::new(table::tests::memory_repository().await);
        let wrapped: Arc<dyn Repository<Item>> = Arc::new(Resilient::new(
            table::tests::memory_repository().await,
            ResiliencePolicy::default(),
        ));
        vec![sql, wide, wrapped]
    }

    async fn seed(repo: &dyn Repository<Item>, names: &[&str]) {
        for name in names {
            repo.create(Item::new(*name, 10.0)).await.unwrap();
        }
    }

    fn names(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.name.as_str()).collect()
    }

    #[tokio::test]
    async fn create_then_find_returns_the_record() {
        for repo in backends().await {
            let created = repo.create(Item::new("Phone", 499.5)).await.unwrap();
            assert!(created.id > 0, "{}", repo.backend());
            assert_eq!(created.version, 0);

            let found = repo.find_by_id(created.id).await.unwrap();
            assert_eq!(found.name, "Phone", "{}", repo.backend());
            assert_eq!(found.price, 499.5);
            assert_eq!(found.version, 0);
            assert_eq!(found.created_at, created.created_at, "{}", repo.backend());
            assert_eq!(found.updated_at, created.updated_at);
            assert!(found.deleted_at.is_none());
        }
    }

    #[tokio::test]
    async fn contains_filter_keeps_insertion_order() {
        for repo in backends().await {
            seed(repo.as_ref(), &["Phone", "Laptop", "Phone Case"]).await;

            let rows = repo.list(&[Filter::contains("name", "Phone")], None).await.unwrap();
            assert_eq!(names(&rows), vec!["Phone", "Phone Case"], "{}", repo.backend());
        }
    }

    #[tokio::test]
    async fn contains_folds_case_beyond_ascii() {
        for repo in backends().await {
            seed(repo.as_ref(), &["ÉCLAIR", "Eclair", "Crème brûlée", "éclair glacé"]).await;

            let rows = repo.list(&[Filter::contains("name", "éclair")], None).await.unwrap();
            assert_eq!(names(&rows), vec!["ÉCLAIR", "éclair glacé"], "{}", repo.backend());

            let rows = repo
                .list(&[Filter::contains("name", "BRÛLÉE")], Some(Pagination::new(5, 0)))
                .await
                .unwrap();
            assert_eq!(names(&rows), vec!["Crème brûlée"], "{}", repo.backend());
        }
    }

    #[tokio::test]
    async fn non_finite_price_filter_is_rejected() {
        for repo in backends().await {
            for bound in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
                let err = repo.list(&[Filter::gte("price", bound)], None).await.unwrap_err();
                assert_eq!(err.kind(), DbErrorKind::ValidationFailed, "{}", repo.backend());
            }
        }
    }

    #[tokio::test]
    async fn pagination_applies_after_filters() {
        for repo in backends().await {
            seed(repo.as_ref(), &["A", "B", "C", "D", "E"]).await;

            let page = repo.list(&[], Some(Pagination::new(2, 1))).await.unwrap();
            assert_eq!(names(&page), vec!["B", "C"], "{}", repo.backend());

            let beyond = repo.list(&[], Some(Pagination::new(2, 10))).await.unwrap();
            assert!(beyond.is_empty(), "{}", repo.backend());

            let unlimited = repo.list(&[], Some(Pagination::new(0, 3))).await.unwrap();
            assert_eq!(unlimited.len(), 5, "{}", repo.backend());
        }
    }

    #[tokio::test]
    async fn exact_name_and_price_range() {
        for repo in backends().await {
            for (name, price) in [("Phone", 500.0), ("Phone", 50.0), ("Laptop", 1200.0)] {
                repo.create(Item::new(name, price)).await.unwrap();
            }

            let rows = repo
                .list(
                    &[
                        Filter::exact("name", "Phone"),
                        Filter::gte("price", 100_i64),
                        Filter::lte("price", 1000.0),
                    ],
                    None,
                )
                .await
                .unwrap();
            assert_eq!(rows.len(), 1, "{}", repo.backend());
            assert_eq!(rows[0].price, 500.0);

            let none = repo.list(&[Filter::exact("name", "Tablet")], None).await.unwrap();
            assert!(none.is_empty());
        }
    }

    #[tokio::test]
    async fn delete_then_find_is_not_found() {
        for repo in backends().await {
            let created = repo.create(Item::new("Phone", 1.0)).await.unwrap();
            repo.delete(created.id).await.unwrap();

            let err = repo.find_by_id(created.id).await.unwrap_err();
            assert_eq!(err.kind(), DbErrorKind::NotFound, "{}", repo.backend());

            let err = repo.delete(created.id).await.unwrap_err();
            assert_eq!(err.kind(), DbErrorKind::NotFound, "{}", repo.backend());
        }
    }

    #[tokio::test]
    async fn stale_update_is_rejected_without_writing() {
        for repo in backends().await {
            let created = repo.create(Item::new("Test Item", 99.99)).await.unwrap();

            let mut first = created.clone();
            first.price = 199.99;
            let updated = repo.update(first).await.unwrap();
            assert_eq!(updated.version, 1, "{}", repo.backend());

            let mut stale = created.clone();
            stale.price = 5.0;
            let err = repo.update(stale).await.unwrap_err();
            assert_eq!(err.kind(), DbErrorKind::ConflictVersion, "{}", repo.backend());

            let stored = repo.find_by_id(created.id).await.unwrap();
            assert_eq!(stored.price, 199.99);
            assert_eq!(stored.version, 1);
        }
    }

    #[tokio::test]
    async fn invalid_entities_are_rejected() {
        for repo in backends().await {
            let err = repo.create(Item::new("", 1.0)).await.unwrap_err();
            assert_eq!(err.kind(), DbErrorKind::ValidationFailed, "{}", repo.backend());

            let created = repo.create(Item::new("Phone", 1.0)).await.unwrap();
            let mut broken = created.clone();
            broken.price = -3.0;
            let err = repo.update(broken).await.unwrap_err();
            assert_eq!(err.kind(), DbErrorKind::ValidationFailed, "{}", repo.backend());
        }
    }

    #[tokio::test]
    async fn ping_reachable_backend() {
        for repo in backends().await {
            repo.ping().await.unwrap();
        }
    }
}
