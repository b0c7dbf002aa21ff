pub mod database;
pub mod kubernetes;

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use benchbot_core::{
    config::LeaderElectionConfig,
    shutdown::{self, Shutdown},
};
use tokio::time::{Instant, sleep, timeout};

/// A named, cluster-wide exclusive lease.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Take the lease for `holder` if it is free or expired, or extend it if `holder`
    /// already owns it. Returns whether `holder` owns the lease afterwards.
    async fn try_acquire_or_renew(&self, holder: &str, lease_duration: Duration) -> Result<bool>;

    /// Give the lease up early if `holder` still owns it.
    async fn release(&self, holder: &str) -> Result<()>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ElectionTimings {
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// How long the leader keeps failing to renew before it steps down.
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl From<&LeaderElectionConfig> for ElectionTimings {
    fn from(config: &LeaderElectionConfig) -> Self {
        Self {
            lease_duration: config.lease_duration(),
            renew_deadline: config.renew_deadline(),
            retry_period: config.retry_period(),
        }
    }
}

/// Why a leadership term ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Term {
    Shutdown,
    LeadershipLost,
}

pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    timings: ElectionTimings,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, identity: String, timings: ElectionTimings) -> Self {
        Self { lock, identity, timings }
    }

    pub fn identity(&self) -> &str { &self.identity }

    /// Returns false when `shutdown` fired before the lease was acquired.
    async fn acquire(&self, shutdown: &mut Shutdown) -> bool {
        tracing::info!("Attempting to acquire {} as {}", self.lock.describe(), self.identity);
        loop {
            match self.lock.try_acquire_or_renew(&self.identity, self.timings.lease_duration).await
            {
                Ok(true) => return true,
                Ok(false) => tracing::debug!("{} is held by another replica", self.lock.describe()),
                Err(e) => tracing::warn!("Failed to acquire {}: {:?}", self.lock.describe(), e),
            }
            tokio::select! {
                _ = sleep(self.timings.retry_period) => {}
                _ = shutdown.wait() => return false,
            }
        }
    }

    /// Renew every retry period until a renewal is refused, renewals keep failing past
    /// the renew deadline, or `shutdown` fires.
    async fn renew(&self, shutdown: &mut Shutdown) -> Term {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = sleep(self.timings.retry_period) => {}
                _ = shutdown.wait() => return Term::Shutdown,
            }
            let remaining = self.timings.renew_deadline.saturating_sub(last_renewed.elapsed());
            let attempt = self.lock.try_acquire_or_renew(&self.identity, self.timings.lease_duration);
            match timeout(remaining, attempt).await {
                Ok(Ok(true)) => last_renewed = Instant::now(),
                Ok(Ok(false)) => {
                    tracing::warn!("{} was taken over by another replica", self.lock.describe());
                    return Term::LeadershipLost;
                }
                Ok(Err(e)) => tracing::warn!("Failed to renew {}: {:?}", self.lock.describe(), e),
                Err(_) => tracing::warn!("Renewing {} timed out", self.lock.describe()),
            }
            if last_renewed.elapsed() >= self.timings.renew_deadline {
                tracing::error!(
                    "No successful renewal of {} within {:?}",
                    self.lock.describe(),
                    self.timings.renew_deadline
                );
                return Term::LeadershipLost;
            }
        }
    }

    /// Wait for the lease, then run `lead` while it is held.
    ///
    /// `lead` gets a signal that fires when leadership ends for any reason and must
    /// return promptly after it does. The lease is released before returning.
    pub async fn run_term<F, Fut>(&self, shutdown: Shutdown, lead: F) -> Result<Term>
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut outer = shutdown;
        if !self.acquire(&mut outer).await {
            return Ok(Term::Shutdown);
        }
        tracing::info!("{} is now the leader", self.identity);
        let (stop_trigger, stop) = shutdown::channel();
        let renew = self.renew(&mut outer);
        tokio::pin!(renew);
        let lead = lead(stop);
        tokio::pin!(lead);
        let mut finished = None;
        let term = tokio::select! {
            term = &mut renew => term,
            result = &mut lead => {
                finished = Some(result);
                Term::Shutdown
            }
        };
        stop_trigger.trigger();
        let result = match finished {
            Some(result) => result,
            None => lead.await,
        };
        if let Err(e) = self.lock.release(&self.identity).await {
            tracing::warn!("Failed to release {}: {:?}", self.lock.describe(), e);
        }
        match term {
            Term::Shutdown => tracing::info!("{} stepped down", self.identity),
            Term::LeadershipLost => tracing::warn!("{} lost leadership", self.identity),
        }
        result.map(|()| term)
    }

    /// Run terms back to back, re-entering the election after every loss, until
    /// `shutdown` fires.
    pub async fn run<F, Fut>(&self, shutdown: Shutdown, mut lead: F) -> Result<()>
    where
        F: FnMut(Shutdown) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            match self.run_term(shutdown.clone(), &mut lead).await? {
                Term::Shutdown => return Ok(()),
                Term::LeadershipLost if shutdown.is_triggered() => return Ok(()),
                Term::LeadershipLost => continue,
            }
        }
    }
}
