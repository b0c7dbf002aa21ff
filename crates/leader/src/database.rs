use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use benchbot_db::Database;
use time::OffsetDateTime;

use crate::LeaseLock;

/// A lease row in the shared database. Only meaningful when every replica points at
/// the same database file.
pub struct DatabaseLeaseLock {
    db: Database,
    name: String,
}

impl DatabaseLeaseLock {
    pub fn new(db: Database, name: &str) -> Self { Self { db, name: name.to_string() } }
}

fn now_ms() -> i64 { (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64 }

#[async_trait]
impl LeaseLock for DatabaseLeaseLock {
    async fn try_acquire_or_renew(&self, holder: &str, lease_duration: Duration) -> Result<bool> {
        let ttl_ms = i64::try_from(lease_duration.as_millis())?;
        self.db.try_acquire_lease(&self.name, holder, now_ms(), ttl_ms).await
    }

    async fn release(&self, holder: &str) -> Result<()> {
        if !self.db.release_lease(&self.name, holder).await? {
            tracing::debug!("{} was no longer held by {}", self.describe(), holder);
        }
        Ok(())
    }

    fn describe(&self) -> String { format!("database lease {}", self.name) }
}
