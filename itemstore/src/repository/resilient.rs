//! Per-call timeout and idempotent read retry around any repository
//!
//! [`Resilient`] decorates a backend repository. Every call runs under the
//! configured timeout; expiry surfaces as `ConnectionFailed` tagged with the
//! operation. `find_by_id`, `list` and `ping` are retried on retriable errors
//! with a fixed delay. Writes are never retried, since a write that timed out
//! may still have been applied.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::error::{DbError, DbOperation, DbResult};
use super::query::{Filter, Pagination};
use super::traits::Repository;
use crate::model::ItemId;

/// Timeout and retry settings applied by [`Resilient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResiliencePolicy {
    /// Upper bound for a single backend call; zero disables the bound
    pub operation_timeout: Duration,
    /// Additional attempts for read operations after the first failure
    pub read_retry_attempts: u32,
    /// Fixed pause between read attempts
    pub read_retry_delay: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            read_retry_attempts: 2,
            read_retry_delay: Duration::from_millis(200),
        }
    }
}

/// Repository decorator adding timeouts and read retry
pub struct Resilient<R> {
    inner: R,
    policy: ResiliencePolicy,
}

impl<R> Resilient<R> {
    pub fn new(inner: R, policy: ResiliencePolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn bounded<T, Fut>(&self, operation: DbOperation, call: Fut) -> DbResult<T>
    where
        Fut: Future<Output = DbResult<T>>,
    {
        let limit = self.policy.operation_timeout;
        if limit.is_zero() {
            return call.await;
        }
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(elapsed) => Err(DbError::connection_failed(operation, elapsed)
                .with_detail(format!("timed out after {:?}", limit))),
        }
    }

    async fn read<T, F, Fut>(&self, operation: DbOperation, call: F) -> DbResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match self.bounded(operation, call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < self.policy.read_retry_attempts => {
                    attempt += 1;
                    tracing::warn!(
                        operation = %operation,
                        attempt,
                        error = %e,
                        "Retrying read after retriable error"
                    );
                    tokio::time::sleep(self.policy.read_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<E, R> Repository<E> for Resilient<R>
where
    E: Send + 'static,
    R: Repository<E>,
{
    async fn create(&self, entity: E) -> DbResult<E> {
        self.bounded(DbOperation::Create, self.inner.create(entity))
            .await
    }

    async fn find_by_id(&self, id: ItemId) -> DbResult<E> {
        self.read(DbOperation::Find, || self.inner.find_by_id(id))
            .await
    }

    async fn update(&self, entity: E) -> DbResult<E> {
        self.bounded(DbOperation::Update, self.inner.update(entity))
            .await
    }

    async fn delete(&self, id: ItemId) -> DbResult<()> {
        self.bounded(DbOperation::Delete, self.inner.delete(id))
            .await
    }

    async fn list(&self, filters: &[Filter], page: Option<Pagination>) -> DbResult<Vec<E>> {
        self.read(DbOperation::List, || self.inner.list(filters, page))
            .await
    }

    async fn ping(&self) -> DbResult<()> {
        self.read(DbOperation::Ping, || self.inner.ping()).await
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::model::Item;
    use crate::repository::DbErrorKind;

    /// Fails the first `failures` calls of every kind, then succeeds
    struct FlakyRepository {
        failures: u32,
        calls: AtomicU32,
        delay: Duration,
    }

    impl FlakyRepository {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                failures: 0,
                calls: AtomicU32::new(0),
                delay,
            }
        }

        async fn step(&self, operation: DbOperation) -> DbResult<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
                return Err(DbError::connection_failed(operation, refused));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Repository<Item> for FlakyRepository {
        async fn create(&self, entity: Item) -> DbResult<Item> {
            self.step(DbOperation::Create).await?;
            Ok(entity)
        }

        async fn find_by_id(&self, id: ItemId) -> DbResult<Item> {
            self.step(DbOperation::Find).await?;
            let mut item = Item::new("Phone", 1.0);
            item.id = id;
            Ok(item)
        }

        async fn update(&self, entity: Item) -> DbResult<Item> {
            self.step(DbOperation::Update).await?;
            Ok(entity)
        }

        async fn delete(&self, _id: ItemId) -> DbResult<()> {
            self.step(DbOperation::Delete).await
        }

        async fn list(&self, _filters: &[Filter], _page: Option<Pagination>) -> DbResult<Vec<Item>> {
            self.step(DbOperation::List).await?;
            Ok(Vec::new())
        }

        async fn ping(&self) -> DbResult<()> {
            self.step(DbOperation::Ping).await
        }

        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    fn policy(attempts: u32) -> ResiliencePolicy {
        ResiliencePolicy {
            operation_timeout: Duration::from_millis(100),
            read_retry_attempts: attempts,
            read_retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_reads_retry_until_success() {
        let repo = Resilient::new(FlakyRepository::new(2), policy(2));
        let item = repo.find_by_id(7).await.unwrap();
        assert_eq!(item.id, 7);
        assert_eq!(repo.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reads_give_up_after_budget() {
        let repo = Resilient::new(FlakyRepository::new(5), policy(1));
        let err = repo.ping().await.unwrap_err();
        assert_eq!(err.kind(), DbErrorKind::ConnectionFailed);
        assert_eq!(repo.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_writes_are_not_retried() {
        let repo = Resilient::new(FlakyRepository::new(1), policy(3));
        let err = repo.create(Item::new("Phone", 1.0)).await.unwrap_err();
        assert_eq!(err.kind(), DbErrorKind::ConnectionFailed);
        assert_eq!(repo.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_connection_failed() {
        let repo = Resilient::new(FlakyRepository::slow(Duration::from_millis(500)), policy(0));
        let err = repo.update(Item::new("Phone", 1.0)).await.unwrap_err();
        assert_eq!(err.kind(), DbErrorKind::ConnectionFailed);
        assert_eq!(err.operation(), DbOperation::Update);
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_usable_as_trait_object() {
        let repo: Arc<dyn Repository<Item>> =
            Arc::new(Resilient::new(FlakyRepository::new(0), ResiliencePolicy::default()));
        assert_eq!(repo.backend(), "flaky");
        assert!(repo.list(&[], None).await.unwrap().is_empty());
    }
}
