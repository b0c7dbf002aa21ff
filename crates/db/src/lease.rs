use anyhow::{Context, Result};
use sqlx::Row;

use crate::Database;

/// Current state of a named lease row.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LeaseRow {
    pub holder: String,
    pub renewed_at_ms: i64,
    pub expires_at_ms: i64,
}

impl Database {
    /// Take or renew `name` for `holder` until `now_ms + ttl_ms`.
    ///
    /// Succeeds when the lease is unheld, already held by `holder`, or expired.
    /// The check and the write are one statement, so two contenders can never
    /// both succeed for the same instant.
    pub async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, holder, renewed_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE
            SET holder = excluded.holder,
                renewed_at = excluded.renewed_at,
                expires_at = excluded.expires_at
            WHERE leases.holder = excluded.holder OR leases.expires_at <= excluded.renewed_at
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now_ms)
        .bind(now_ms + ttl_ms)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to acquire lease {name}"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Expire the lease immediately if `holder` still owns it.
    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE leases SET expires_at = 0 WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to release lease {name}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_lease(&self, name: &str) -> Result<Option<LeaseRow>> {
        let row = sqlx::query("SELECT holder, renewed_at, expires_at FROM leases WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read lease {name}"))?;
        Ok(row.map(|row| LeaseRow {
            holder: row.get("holder"),
            renewed_at_ms: row.get("renewed_at"),
            expires_at_ms: row.get("expires_at"),
        }))
    }
}
