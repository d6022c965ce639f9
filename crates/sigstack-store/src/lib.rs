//! Postgres-backed canonical item store: schema bootstrap, idempotent
//! upserts, and the ordered/filtered/paginated read contract.

use chrono::{DateTime, Utc};
use sigstack_core::{Item, NewItem};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sigstack-store";

/// Startup-fatal store failure: the connection could not be established or
/// the schema could not be brought up. The process must not cycle past this.
#[derive(Debug, Error)]
#[error("store initialization failed: {0}")]
pub struct SchemaError(#[from] sqlx::Error);

/// Per-call persistence failure (connectivity or constraint). Recoverable:
/// the item is simply not updated this cycle and the next cycle retries.
#[derive(Debug, Error)]
#[error("database operation failed: {0}")]
pub struct PersistenceError(#[from] sqlx::Error);

/// Filter + pagination parameters for [`Store::list`].
#[derive(Debug, Clone)]
pub struct ItemQuery {
    /// Case-insensitive substring filter over `title` or `source`.
    pub q: Option<String>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

impl Default for ItemQuery {
    fn default() -> Self {
        Self {
            q: None,
            page: 1,
            page_size: 20,
        }
    }
}

const MAX_PAGE_SIZE: u32 = 100;

impl ItemQuery {
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size.clamp(1, MAX_PAGE_SIZE))
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * self.limit()
    }

    /// ILIKE pattern for the filter, or `None` when the filter is blank.
    pub fn pattern(&self) -> Option<String> {
        let q = self.q.as_deref()?.trim();
        if q.is_empty() {
            None
        } else {
            Some(format!("%{q}%"))
        }
    }
}

/// One page of items plus the total matching row count.
#[derive(Debug, Clone)]
pub struct ItemPage {
    pub total: i64,
    pub items: Vec<Item>,
}

/// Owned handle over the shared Postgres pool, injected into the scheduler
/// and the read API. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, SchemaError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Builds a store without touching the network. Connections are opened
    /// on first use, so startup paths that only wire routes can stay cheap.
    pub fn connect_lazy(database_url: &str) -> Result<Self, SchemaError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the items table, uniqueness constraint, and secondary indexes
    /// if absent. Safe to call repeatedly.
    pub async fn ensure_schema(&self) -> Result<(), SchemaError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id BIGSERIAL PRIMARY KEY,
                source TEXT NOT NULL,
                external_id TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                published_at TIMESTAMPTZ NULL,
                fetched_at TIMESTAMPTZ NOT NULL,
                UNIQUE (source, external_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_published_at ON items (published_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_source ON items (source)")
            .execute(&self.pool)
            .await?;
        debug!("item schema ready");
        Ok(())
    }

    /// Inserts or updates the row keyed on `(source, external_id)` in a
    /// single atomic statement. A conflicting row keeps its `id` and
    /// first-seen ordering; `title`, `url`, `published_at`, and `fetched_at`
    /// are overwritten. `fetched_at` comes from the caller, not the store.
    pub async fn upsert(
        &self,
        item: &NewItem,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO items (source, external_id, title, url, published_at, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source, external_id)
            DO UPDATE SET
              title = EXCLUDED.title,
              url = EXCLUDED.url,
              published_at = EXCLUDED.published_at,
              fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(&item.source)
        .bind(&item.external_id)
        .bind(&item.title)
        .bind(&item.url)
        .bind(item.published_at)
        .bind(fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Connectivity probe for the read API's health endpoint.
    pub async fn ping(&self) -> Result<(), PersistenceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Items ordered by `published_at DESC NULLS LAST, fetched_at DESC`,
    /// optionally filtered, with the total matching count.
    pub async fn list(&self, query: &ItemQuery) -> Result<ItemPage, PersistenceError> {
        let limit = query.limit();
        let offset = query.offset();

        let (rows, total) = match query.pattern() {
            Some(pattern) => {
                let rows = sqlx::query(
                    r#"
                    SELECT id, source, external_id, title, url, published_at, fetched_at
                      FROM items
                     WHERE title ILIKE $1 OR source ILIKE $1
                     ORDER BY published_at DESC NULLS LAST, fetched_at DESC
                     LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(&pattern)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM items WHERE title ILIKE $1 OR source ILIKE $1",
                )
                .bind(&pattern)
                .fetch_one(&self.pool)
                .await?;
                (rows, total)
            }
            None => {
                let rows = sqlx::query(
                    r#"
                    SELECT id, source, external_id, title, url, published_at, fetched_at
                      FROM items
                     ORDER BY published_at DESC NULLS LAST, fetched_at DESC
                     LIMIT $1 OFFSET $2
                    "#,
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
                    .fetch_one(&self.pool)
                    .await?;
                (rows, total)
            }
        };

        let items = rows
            .into_iter()
            .map(row_to_item)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(ItemPage { total, items })
    }
}

fn row_to_item(row: PgRow) -> Result<Item, sqlx::Error> {
    Ok(Item {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        published_at: row.try_get("published_at")?,
        fetched_at: row.try_get("fetched_at")?,
    })
}
