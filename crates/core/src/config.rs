use std::time::Duration;

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::util::normalize_endpoint;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub github: GitHubConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
}

impl Config {
    /// Fill in derived values and reject configurations the server cannot run with.
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(endpoint) = self.storage.endpoint.take() {
            self.storage.endpoint = Some(normalize_endpoint(&endpoint));
        }
        ensure!(!self.github.webhook_secret.is_empty(), "github.webhook_secret must be set");
        ensure!(self.pipeline.poll_max_attempts > 0, "pipeline.poll_max_attempts must be > 0");
        ensure!(self.server.max_concurrent_handlers > 0, "server.max_concurrent_handlers must be > 0");
        if self.pipeline.poll_backoff_factor < 1.0 {
            bail!("pipeline.poll_backoff_factor must be >= 1.0");
        }
        if self.leader_election.enabled {
            let election = &self.leader_election;
            election.validate()?;
            // A replica that missed its renew deadline must finish draining before
            // another one can take the lease over.
            ensure!(
                election.renew_deadline_secs + self.server.shutdown_grace_secs
                    < election.lease_duration_secs,
                "leader_election.renew_deadline_secs ({}) plus server.shutdown_grace_secs ({}) \
                 must be below lease_duration_secs ({})",
                election.renew_deadline_secs,
                self.server.shutdown_grace_secs,
                election.lease_duration_secs
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub address: String,
    /// Upper bound on plugin tasks running at once across all webhook deliveries.
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_concurrent_handlers() -> usize { 32 }

fn default_shutdown_grace_secs() -> u64 { 30 }

fn default_request_timeout_secs() -> u64 { 60 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub url: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: String,
    pub webhook_secret: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_api_url() -> String { "https://api.github.com".to_string() }

/// Object storage coordinates forwarded to benchmark runs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_interval_secs: u64,
    pub poll_max_attempts: u32,
    pub poll_backoff_factor: f64,
    pub poll_max_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            poll_max_attempts: 180,
            poll_backoff_factor: 1.0,
            poll_max_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    #[default]
    Kubernetes,
    Database,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub backend: LeaseBackend,
    pub lease_name: String,
    pub namespace: String,
    /// How long a lease stays valid without renewal.
    pub lease_duration_secs: u64,
    /// How long the holder keeps retrying renewals before it steps down.
    pub renew_deadline_secs: u64,
    /// Interval between acquire/renew attempts.
    pub retry_period_secs: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: LeaseBackend::Kubernetes,
            lease_name: "benchbot-lock".to_string(),
            namespace: "kube-system".to_string(),
            lease_duration_secs: 60,
            renew_deadline_secs: 15,
            retry_period_secs: 5,
        }
    }
}

impl LeaderElectionConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.lease_name.is_empty(), "leader_election.lease_name must be set");
        ensure!(self.retry_period_secs > 0, "leader_election.retry_period_secs must be > 0");
        ensure!(
            self.lease_duration_secs > self.renew_deadline_secs,
            "leader_election.lease_duration_secs ({}) must exceed renew_deadline_secs ({})",
            self.lease_duration_secs,
            self.renew_deadline_secs
        );
        ensure!(
            self.renew_deadline_secs > self.retry_period_secs,
            "leader_election.renew_deadline_secs ({}) must exceed retry_period_secs ({})",
            self.renew_deadline_secs,
            self.retry_period_secs
        );
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration { Duration::from_secs(self.lease_duration_secs) }

    pub fn renew_deadline(&self) -> Duration { Duration::from_secs(self.renew_deadline_secs) }

    pub fn retry_period(&self) -> Duration { Duration::from_secs(self.retry_period_secs) }
}
