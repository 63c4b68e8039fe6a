//! Relational repository over MySQL or SQLite
//!
//! Both dialects go through the sqlx `Any` driver, so the same statements
//! (with `?` placeholders) run against MySQL in production and an in-memory
//! SQLite database in tests. Timestamps are stored as RFC 3339 text with
//! microsecond precision, which both dialects compare and round-trip
//! losslessly.
//!
//! Updates are conditional on the stored version (`WHERE id = ? AND
//! version = ?`), so two writers racing on the same row cannot both win.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Executor, QueryBuilder};

use crate::config::{RelationalConfig, RelationalDriver};
use crate::model::{now_utc, Item, ItemId};
use crate::repository::{
    DbError, DbErrorKind, DbOperation, DbResult, Filter, ItemPredicate, Pagination, Repository,
};

const SELECT_ITEMS: &str =
    "SELECT id, name, price, version, created_at, updated_at, deleted_at FROM items";

const SELECT_ITEM_BY_ID: &str =
    "SELECT id, name, price, version, created_at, updated_at, deleted_at FROM items WHERE id = ?";

const INSERT_ITEM: &str = "INSERT INTO items (name, price, version, created_at, updated_at, deleted_at) \
     VALUES (?, ?, 0, ?, ?, ?)";

/// SQLite reports no insert id through `Any`, so the row hands it back
const INSERT_ITEM_RETURNING_ID: &str =
    "INSERT INTO items (name, price, version, created_at, updated_at, deleted_at) \
     VALUES (?, ?, 0, ?, ?, ?) RETURNING id";

const UPDATE_ITEM: &str = "UPDATE items \
     SET name = ?, price = ?, version = version + 1, updated_at = ?, deleted_at = ? \
     WHERE id = ? AND version = ?";

const MYSQL_CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS items (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    price DOUBLE NOT NULL,
    version BIGINT NOT NULL DEFAULT 0,
    created_at VARCHAR(32) NOT NULL,
    updated_at VARCHAR(32) NOT NULL,
    deleted_at VARCHAR(32) NULL,
    CONSTRAINT chk_items_name CHECK (CHAR_LENGTH(TRIM(name)) > 0),
    CONSTRAINT chk_items_price CHECK (price >= 0)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

const SQLITE_CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL CHECK (length(trim(name)) > 0),
    price REAL NOT NULL CHECK (price >= 0),
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
)";

/// Message fragments used when the driver reports no structured error kind
const DUPLICATE_PATTERNS: &[&str] = &["Duplicate entry", "UNIQUE constraint failed"];
const VALIDATION_PATTERNS: &[&str] = &["CHECK constraint failed", "Check constraint", "validation failed"];

type ItemRow = (i64, String, f64, i64, String, String, Option<String>);

impl RelationalDriver {
    fn create_table_sql(self) -> &'static str {
        match self {
            RelationalDriver::Mysql => MYSQL_CREATE_TABLE,
            RelationalDriver::Sqlite => SQLITE_CREATE_TABLE,
        }
    }

    /// Statements run on every new pooled connection
    fn session_statements(self) -> &'static [&'static str] {
        match self {
            RelationalDriver::Mysql => &[
                "SET time_zone = '+00:00'",
                "SET SESSION sql_mode = 'STRICT_ALL_TABLES,NO_ENGINE_SUBSTITUTION'",
            ],
            RelationalDriver::Sqlite => &["PRAGMA foreign_keys = ON"],
        }
    }

    /// SQLite's `LOWER` and `LIKE` fold ASCII only, so case-insensitive
    /// substring matches run in process there
    fn evaluates_natively(self, predicate: &ItemPredicate) -> bool {
        !matches!(
            (self, predicate),
            (RelationalDriver::Sqlite, ItemPredicate::NameContains(_))
        )
    }
}

/// [`Repository`] implementation backed by a SQL connection pool
#[derive(Debug, Clone)]
pub struct RelationalRepository {
    pool: AnyPool,
    driver: RelationalDriver,
}

impl RelationalRepository {
    /// Bring the pool up with bounded retry, then create the table if absent
    pub async fn connect(config: &RelationalConfig) -> DbResult<Self> {
        sqlx::any::install_default_drivers();

        let url = config
            .connection_url()
            .map_err(|e| DbError::validation(DbOperation::Connect, e.to_string()))?;
        let pool = create_pool_with_retries(config, &url).await?;

        let repository = Self::from_pool(pool, config.driver);
        repository.ensure_schema().await?;
        Ok(repository)
    }

    /// Wrap an existing pool without touching the schema
    pub fn from_pool(pool: AnyPool, driver: RelationalDriver) -> Self {
        Self { pool, driver }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn driver(&self) -> RelationalDriver {
        self.driver
    }

    /// Create the `items` table if it does not exist yet
    pub async fn ensure_schema(&self) -> DbResult<()> {
        self.pool
            .execute(self.driver.create_table_sql())
            .await
            .map_err(|e| map_sqlx_error(DbOperation::CreateTable, e))?;
        tracing::info!(backend = "relational", driver = ?self.driver, "Items table ready");
        Ok(())
    }
}

#[async_trait]
impl Repository<Item> for RelationalRepository {
    async fn create(&self, item: Item) -> DbResult<Item> {
        item.validate(DbOperation::Create)?;
        if item.id != 0 {
            return Err(DbError::validation(
                DbOperation::Create,
                "identifier must be unset on create",
            ));
        }

        let now = now_utc();
        let stamp = format_timestamp(now);
        let deleted_at = item.deleted_at.map(format_timestamp);
        let map_err = |e: sqlx::Error| map_sqlx_error(DbOperation::Create, e);

        let generated = match self.driver {
            RelationalDriver::Mysql => sqlx::query(INSERT_ITEM)
                .bind(item.name.as_str())
                .bind(item.price)
                .bind(stamp.clone())
                .bind(stamp)
                .bind(deleted_at)
                .execute(&self.pool)
                .await
                .map_err(map_err)?
                .last_insert_id(),
            RelationalDriver::Sqlite => {
                let (id,): (i64,) = sqlx::query_as(INSERT_ITEM_RETURNING_ID)
                    .bind(item.name.as_str())
                    .bind(item.price)
                    .bind(stamp.clone())
                    .bind(stamp)
                    .bind(deleted_at)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_err)?;
                Some(id)
            }
        };

        let id = generated
            .and_then(|id| ItemId::try_from(id).ok())
            .ok_or_else(|| {
                DbError::new(DbOperation::Create, DbErrorKind::Opaque)
                    .with_detail("backend did not report the generated identifier")
            })?;

        tracing::debug!(backend = "relational", id, "Item created");
        Ok(item.into_created(id, now))
    }

    async fn find_by_id(&self, id: ItemId) -> DbResult<Item> {
        let key = row_key(DbOperation::Find, id)?;
        let row: Option<ItemRow> = sqlx::query_as(SELECT_ITEM_BY_ID)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(DbOperation::Find, e))?;

        match row {
            Some(row) => decode_row(row),
            None => Err(DbError::not_found(DbOperation::Find, format!("item {}", id))),
        }
    }

    async fn update(&self, item: Item) -> DbResult<Item> {
        item.validate(DbOperation::Update)?;
        let key = row_key(DbOperation::Update, item.id)?;
        let expected = i64::try_from(item.version).map_err(|_| {
            DbError::conflict(DbOperation::Update, format!("version {} out of range", item.version))
        })?;

        let map_err = |e: sqlx::Error| map_sqlx_error(DbOperation::Update, e);
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let result = sqlx::query(UPDATE_ITEM)
            .bind(item.name.as_str())
            .bind(item.price)
            .bind(format_timestamp(now_utc()))
            .bind(item.deleted_at.map(format_timestamp))
            .bind(key)
            .bind(expected)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        if result.rows_affected() == 0 {
            let stored: Option<(i64,)> = sqlx::query_as("SELECT version FROM items WHERE id = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_err)?;

            return Err(match stored {
                None => DbError::not_found(DbOperation::Update, format!("item {}", item.id)),
                Some((version,)) => DbError::conflict(
                    DbOperation::Update,
                    format!(
                        "item {} is at version {}, update expected {}",
                        item.id, version, item.version
                    ),
                ),
            });
        }

        let row: ItemRow = sqlx::query_as(SELECT_ITEM_BY_ID)
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;

        let updated = decode_row(row)?;
        tracing::debug!(backend = "relational", id = updated.id, version = updated.version, "Item updated");
        Ok(updated)
    }

    async fn delete(&self, id: ItemId) -> DbResult<()> {
        let key = row_key(DbOperation::Delete, id)?;
        let result = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(DbOperation::Delete, e))?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(DbOperation::Delete, format!("item {}", id)));
        }
        Ok(())
    }

    async fn list(&self, filters: &[Filter], page: Option<Pagination>) -> DbResult<Vec<Item>> {
        let predicates = ItemPredicate::resolve_all(filters)?;
        let (native, in_process): (Vec<_>, Vec<_>) = predicates
            .into_iter()
            .partition(|p| self.driver.evaluates_natively(p));
        let page = page.filter(Pagination::is_effective);

        let mut query = QueryBuilder::<Any>::new(SELECT_ITEMS);
        push_predicates(&mut query, &native);
        query.push(" ORDER BY id ASC");
        if let Some(page) = page.filter(|_| in_process.is_empty()) {
            query
                .push(" LIMIT ")
                .push_bind(i64::from(page.limit))
                .push(" OFFSET ")
                .push_bind(i64::from(page.offset));
        }

        let rows: Vec<ItemRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(DbOperation::List, e))?;

        let items = rows.into_iter().map(decode_row).collect::<DbResult<Vec<_>>>()?;
        if in_process.is_empty() {
            return Ok(items);
        }

        let matching: Vec<Item> = items
            .into_iter()
            .filter(|item| in_process.iter().all(|p| p.matches(item)))
            .collect();
        Ok(match page {
            Some(page) => page.apply(matching),
            None => matching,
        })
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(DbOperation::Ping, e))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "relational"
    }
}

/// Create the pool, retrying with a fixed delay
async fn create_pool_with_retries(config: &RelationalConfig, url: &str) -> DbResult<AnyPool> {
    let url_safe = sanitize_connection_url(url);
    let pool = retry_connect(config.max_retries, config.retry_delay(), &url_safe, || {
        pool_options(config).connect(url)
    })
    .await?;

    tracing::info!(
        backend = "relational",
        "Database connection pool created: max_open={}, max_idle={}",
        config.max_open_connections,
        config.min_connections()
    );
    Ok(pool)
}

/// Run `connect` at most `max_attempts` times (never fewer than once),
/// sleeping `delay` between failed attempts
async fn retry_connect<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    url_safe: &str,
    mut connect: F,
) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(connected) => {
                if attempt > 1 {
                    tracing::info!(
                        backend = "relational",
                        "Database connection established after {} attempt(s)",
                        attempt
                    );
                }
                return Ok(connected);
            }
            Err(e @ sqlx::Error::Configuration(_)) => {
                tracing::error!(url = %url_safe, "Invalid database connection settings: {}", e);
                return Err(DbError::validation(DbOperation::Connect, e.to_string()).with_source(e));
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(
                    url = %url_safe,
                    "Failed to connect to database after {} attempts: {}",
                    attempt,
                    e
                );
                return Err(DbError::connection_failed(DbOperation::Connect, e));
            }
            Err(e) => {
                tracing::warn!(
                    url = %url_safe,
                    attempt,
                    "Database connection attempt {} of {} failed: {}. Retrying in {:?}...",
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn pool_options(config: &RelationalConfig) -> AnyPoolOptions {
    let driver = config.driver;
    AnyPoolOptions::new()
        .max_connections(config.max_open_connections)
        .min_connections(config.min_connections())
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(config.idle_timeout())
        .max_lifetime(config.max_lifetime())
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                for statement in driver.session_statements() {
                    (&mut *conn).execute(*statement).await?;
                }
                Ok(())
            })
        })
}

/// Hide the password of a connection URL for logging
fn sanitize_connection_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_ok() {
                parsed.to_string()
            } else {
                url.to_string()
            }
        }
        _ => url.to_string(),
    }
}

fn push_predicates(query: &mut QueryBuilder<'_, Any>, predicates: &[ItemPredicate]) {
    for (i, predicate) in predicates.iter().enumerate() {
        query.push(if i == 0 { " WHERE " } else { " AND " });
        match predicate {
            ItemPredicate::NameEquals(name) => {
                query.push("name = ").push_bind(name.clone());
            }
            ItemPredicate::NameContains(needle) => {
                query
                    .push("LOWER(name) LIKE ")
                    .push_bind(like_pattern(needle))
                    .push(" ESCAPE '!'");
            }
            ItemPredicate::PriceEquals(price) => {
                query.push("price = ").push_bind(*price);
            }
            ItemPredicate::PriceAtLeast(price) => {
                query.push("price >= ").push_bind(*price);
            }
            ItemPredicate::PriceAtMost(price) => {
                query.push("price <= ").push_bind(*price);
            }
        }
    }
}

/// `%needle%` with LIKE metacharacters escaped by `!`
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '!' | '%' | '_') {
            pattern.push('!');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Identifiers above `i64::MAX` cannot exist in the table
fn row_key(operation: DbOperation, id: ItemId) -> DbResult<i64> {
    i64::try_from(id).map_err(|_| DbError::not_found(operation, format!("item {}", id)))
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| {
            DbError::opaque(DbOperation::Decode, e).with_detail(format!("invalid timestamp '{}'", raw))
        })
}

fn decode_row(row: ItemRow) -> DbResult<Item> {
    let (id, name, price, version, created_at, updated_at, deleted_at) = row;
    let out_of_range = |field: &str, value: i64| {
        DbError::new(DbOperation::Decode, DbErrorKind::Opaque)
            .with_detail(format!("{} {} out of range", field, value))
    };

    Ok(Item {
        id: ItemId::try_from(id).map_err(|_| out_of_range("id", id))?,
        name,
        price,
        version: u64::try_from(version).map_err(|_| out_of_range("version", version))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        deleted_at: deleted_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

/// Map a driver error onto the repository taxonomy
///
/// Structured error kinds from the driver come first; message patterns are
/// only consulted for database errors that carry no kind.
fn map_sqlx_error(operation: DbOperation, err: sqlx::Error) -> DbError {
    let (kind, detail) = classify_sqlx_error(&err);
    let mapped = DbError::new(operation, kind).with_source(err);
    match detail {
        Some(detail) => mapped.with_detail(detail),
        None => mapped,
    }
}

fn classify_sqlx_error(err: &sqlx::Error) -> (DbErrorKind, Option<String>) {
    use sqlx::Error as E;
    match err {
        E::RowNotFound => (DbErrorKind::NotFound, None),
        E::Io(_) | E::Tls(_) | E::PoolTimedOut | E::PoolClosed | E::WorkerCrashed => {
            (DbErrorKind::ConnectionFailed, None)
        }
        E::Database(db) if db.is_unique_violation() => {
            (DbErrorKind::DuplicateKey, Some(db.message().to_string()))
        }
        E::Database(db) if db.is_check_violation() => {
            (DbErrorKind::ValidationFailed, Some(db.message().to_string()))
        }
        E::Database(db) => {
            let message = db.message();
            if DUPLICATE_PATTERNS.iter().any(|p| message.contains(p)) {
                (DbErrorKind::DuplicateKey, Some(message.to_string()))
            } else if VALIDATION_PATTERNS.iter().any(|p| message.contains(p)) {
                (DbErrorKind::ValidationFailed, Some(message.to_string()))
            } else {
                (DbErrorKind::Opaque, None)
            }
        }
        _ => (DbErrorKind::Opaque, None),
    }
}
