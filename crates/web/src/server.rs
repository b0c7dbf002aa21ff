use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use benchbot_core::{
    config::{Config, LeaseBackend},
    shutdown::Shutdown,
};
use benchbot_db::{Database, MetaStore};
use benchbot_leader::{
    ElectionTimings, LeaderElector, LeaseLock, database::DatabaseLeaseLock,
    kubernetes::KubernetesLeaseLock,
};
use benchbot_plugins::{Agent, Registry, dispatcher::Dispatcher};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::{AppState, app};

/// Long-lived collaborators shared by every serving term.
pub struct Services {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub agent: Arc<Agent>,
    pub store: Arc<dyn MetaStore>,
}

/// Serve until `shutdown` fires, then drain the plugin tasks started while serving.
pub async fn serve(services: &Services, shutdown: Shutdown) -> Result<()> {
    let config = &services.config;
    let dispatcher = Arc::new(Dispatcher::new(
        services.registry.clone(),
        services.agent.clone(),
        config.server.max_concurrent_handlers,
    ));
    let state = AppState {
        config: config.clone(),
        store: services.store.clone(),
        dispatcher: dispatcher.clone(),
    };

    let listener = TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.address))?;
    tracing::info!("Web server: Listening on {}", listener.local_addr()?);

    let service = app(state).into_make_service_with_connect_info::<SocketAddr>();
    let mut stop = shutdown;
    let result = axum::serve(listener, service)
        .with_graceful_shutdown(async move { stop.wait().await })
        .await
        .context("Web server error");
    tracing::info!("Web server stopped");

    dispatcher.shutdown(Duration::from_secs(config.server.shutdown_grace_secs)).await;
    result
}

/// Serve only while this replica holds the lease, re-entering the election after
/// every loss until `shutdown` fires.
pub async fn run_elected(services: &Services, db: &Database, shutdown: Shutdown) -> Result<()> {
    let election = &services.config.leader_election;
    let lock: Arc<dyn LeaseLock> = match election.backend {
        LeaseBackend::Kubernetes => Arc::new(
            KubernetesLeaseLock::in_cluster(&election.namespace, &election.lease_name)
                .context("Failed to set up Kubernetes lease")?,
        ),
        LeaseBackend::Database => {
            Arc::new(DatabaseLeaseLock::new(db.clone(), &election.lease_name))
        }
    };
    let identity = Uuid::new_v4().to_string();
    tracing::info!("Leader election enabled via {} as {}", lock.describe(), identity);
    let elector = LeaderElector::new(lock, identity, ElectionTimings::from(election));
    elector.run(shutdown, |stop| serve(services, stop)).await
}
