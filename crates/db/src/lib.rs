mod lease;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use benchbot_core::{config::DbConfig, models::StoreKey};
use sqlx::{Pool, Row, Sqlite, migrate::MigrateDatabase, sqlite::SqlitePoolOptions};
use time::OffsetDateTime;

pub use lease::LeaseRow;

/// Durable key→bytes store shared by the status endpoint and the pipeline polls.
///
/// Writes overwrite; nothing is ever deleted. Reads are plain snapshot reads.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &StoreKey, value: &[u8]) -> Result<()>;

    /// Write only if nothing is stored under `key` yet. Returns whether the write happened.
    async fn put_if_absent(&self, key: &StoreKey, value: &[u8]) -> Result<bool>;

    /// Records strictly below `prefix`, ordered by key.
    async fn list_prefix(
        &self,
        prefix: &StoreKey,
        order: Order,
        limit: Option<u32>,
    ) -> Result<Vec<Record>>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(5))
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await
            .context("Failed to connect to database")?;
        Self::from_pool(pool).await
    }

    /// A private database that lives as long as the returned handle.
    pub async fn in_memory() -> Result<Self> {
        // A single connection that is never recycled: every new in-memory
        // connection would otherwise see an empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: Pool<Sqlite>) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) { self.pool.close().await }
}

fn now_unix() -> i64 { OffsetDateTime::now_utc().unix_timestamp() }

/// Half-open key range `[prefix/, prefix0)` covering every key below `prefix`.
fn prefix_range(prefix: &StoreKey) -> (String, String) {
    let path = prefix.to_path();
    // '0' sorts directly after '/'
    (format!("{path}/"), format!("{path}0"))
}

#[async_trait]
impl MetaStore for Database {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = ?")
            .bind(key.to_path())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read {key}"))?;
        Ok(row.map(|row| row.get::<Vec<u8>, _>("value")))
    }

    async fn put(&self, key: &StoreKey, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE
            SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key.to_path())
        .bind(value)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write {key}"))?;
        tracing::debug!("Stored {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn put_if_absent(&self, key: &StoreKey, value: &[u8]) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key.to_path())
        .bind(value)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write {key}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_prefix(
        &self,
        prefix: &StoreKey,
        order: Order,
        limit: Option<u32>,
    ) -> Result<Vec<Record>> {
        let (start, end) = prefix_range(prefix);
        let query = match order {
            Order::Ascending => {
                "SELECT key, value FROM metadata WHERE key >= ? AND key < ? ORDER BY key ASC LIMIT ?"
            }
            Order::Descending => {
                "SELECT key, value FROM metadata WHERE key >= ? AND key < ? ORDER BY key DESC LIMIT ?"
            }
        };
        let rows = sqlx::query(query)
            .bind(start)
            .bind(end)
            .bind(limit.map_or(-1, i64::from))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to list {prefix}"))?;
        Ok(rows
            .into_iter()
            .map(|row| Record { key: row.get("key"), value: row.get("value") })
            .collect())
    }
}
