use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use benchbot_core::shutdown::{self, Shutdown, ShutdownTrigger};
use benchbot_github::webhook::IssueCommentEvent;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::Instrument;

use crate::{Agent, PipelineError, PluginContext, Registry};

/// Fans each issue comment out to every registered plugin.
///
/// Every plugin invocation is its own task; at most `max_concurrent` of them run at
/// once. The tasks belong to the dispatcher, so shutting it down cancels their waits
/// and drains them.
pub struct Dispatcher {
    registry: Arc<Registry>,
    agent: Arc<Agent>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, agent: Arc<Agent>, max_concurrent: usize) -> Self {
        let (trigger, shutdown) = shutdown::channel();
        Self {
            registry,
            agent,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            trigger,
            shutdown,
        }
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule every plugin for `event` and return how many were scheduled.
    /// Does not wait for any of them.
    pub fn dispatch(&self, event: IssueCommentEvent) -> usize {
        if self.shutdown.is_triggered() {
            tracing::warn!("Dispatcher is shutting down, dropping comment on #{}", event.number);
            return 0;
        }
        let event = Arc::new(event);
        let mut tasks = self.tasks();
        // Reap whatever finished since the last delivery.
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                tracing::error!("Plugin task failed: {:?}", e);
            }
        }
        for (name, handler) in self.registry.iter() {
            let span = tracing::info_span!(
                "plugin",
                plugin = name,
                owner = %event.owner,
                repo = %event.repo,
                pr = event.number
            );
            let ctx = PluginContext {
                agent: self.agent.clone(),
                event: event.clone(),
                shutdown: self.shutdown.clone(),
            };
            let handler = handler.clone();
            let permits = self.permits.clone();
            let name = name.to_string();
            tasks.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    match handler(ctx).await {
                        Ok(dispatched) => tracing::info!(
                            uuid = %dispatched.uuid,
                            "{} dispatched {}",
                            name,
                            dispatched.kind
                        ),
                        Err(PipelineError::NoMatch) => tracing::debug!("No matching command"),
                        Err(e @ PipelineError::Unauthorized { .. }) => tracing::warn!("{e}"),
                        Err(e @ PipelineError::Cancelled { .. }) => tracing::info!("{e}"),
                        Err(e) => tracing::error!("{} failed: {:?}", name, anyhow::Error::from(e)),
                    }
                }
                .instrument(span),
            );
        }
        self.registry.len()
    }

    /// Number of plugin tasks not yet reaped.
    pub fn in_flight(&self) -> usize { self.tasks().len() }

    pub fn is_shut_down(&self) -> bool { self.shutdown.is_triggered() }

    /// Stop accepting work, cancel pending waits and give running tasks `grace` to
    /// finish before aborting them.
    pub async fn shutdown(&self, grace: Duration) {
        self.trigger.trigger();
        let mut tasks = std::mem::take(&mut *self.tasks());
        if tasks.is_empty() {
            return;
        }
        tracing::info!("Waiting for {} plugin tasks", tasks.len());
        let drain = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!("Plugin task failed: {:?}", e);
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("Aborting {} plugin tasks after {:?}", tasks.len(), grace);
            tasks.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use benchbot_core::models::DispatchKind;

    use super::*;
    use crate::{
        Dispatched, HandlerResult,
        testing::{FakeGitHub, MemoryStore, agent, comment},
    };

    fn dispatched() -> Dispatched {
        Dispatched {
            kind: DispatchKind::BuildDocker,
            uuid: "u".to_string(),
            payload: Default::default(),
        }
    }

    async fn no_match(_: PluginContext) -> HandlerResult { Err(PipelineError::NoMatch) }

    async fn succeeds(_: PluginContext) -> HandlerResult { Ok(dispatched()) }

    async fn panics(_: PluginContext) -> HandlerResult { panic!("boom") }

    async fn times_out(_: PluginContext) -> HandlerResult {
        Err(PipelineError::Timeout { key: "k".to_string(), attempts: 1 })
    }

    async fn waits_for_shutdown(mut ctx: PluginContext) -> HandlerResult {
        ctx.shutdown.wait().await;
        Err(PipelineError::Cancelled { key: "k".to_string() })
    }

    async fn hangs(_: PluginContext) -> HandlerResult { std::future::pending().await }

    fn dispatcher(registry: Registry, max: usize) -> Dispatcher {
        let agent =
            agent(Arc::new(FakeGitHub::new("foo", None)), Arc::new(MemoryStore::default()));
        Dispatcher::new(Arc::new(registry), agent, max)
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = Registry::new();
        registry.register("a", no_match);
        registry.register("b", no_match);
        registry.register("a", succeeds);
        assert_eq!(registry.names().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry.register("panics", panics);
        registry.register("fails", times_out);
        let counter = ran.clone();
        registry.register("works", move |ctx: PluginContext| {
            let counter = counter.clone();
            async move {
                assert_eq!(ctx.event.number, 42);
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, PipelineError>(dispatched())
            }
        });
        let dispatcher = dispatcher(registry, 8);
        assert_eq!(dispatcher.dispatch(comment("/run-perf master", "OWNER")), 3);
        assert_eq!(dispatcher.dispatch(comment("/run-perf master", "OWNER")), 3);
        dispatcher.shutdown(Duration::from_secs(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        for name in ["a", "b", "c", "d", "e"] {
            let (running, peak) = (running.clone(), peak.clone());
            registry.register(name, move |_| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, PipelineError>(dispatched())
                }
            });
        }
        let dispatcher = dispatcher(registry, 2);
        dispatcher.dispatch(comment("x", "OWNER"));
        dispatcher.shutdown(Duration::from_secs(60)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_waits_and_rejects_new_work() {
        let mut registry = Registry::new();
        registry.register("waits", waits_for_shutdown);
        registry.register("hangs", hangs);
        let dispatcher = dispatcher(registry, 4);
        assert_eq!(dispatcher.dispatch(comment("x", "OWNER")), 2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = tokio::time::Instant::now();
        dispatcher.shutdown(Duration::from_secs(5)).await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(dispatcher.is_shut_down());
        assert_eq!(dispatcher.dispatch(comment("x", "OWNER")), 0);
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
