mod handlers;
mod server;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{HeaderName, Request, StatusCode, header},
};
use benchbot_core::{config::Config, shutdown};
use benchbot_db::{Database, MetaStore};
use benchbot_github::GitHub;
use benchbot_plugins::{Agent, Registry, dispatcher::Dispatcher, register_all};
use clap::Parser;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    normalize_path::NormalizePathLayer,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<dyn MetaStore>,
    dispatcher: Arc<Dispatcher>,
}

/// GitHub chatbot that turns PR comments into CI builds and benchmark runs.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "BENCHBOT_CONFIG", default_value = "config.yml")]
    config: PathBuf,
    /// Address to listen on, overriding server.address
    #[arg(long, env = "BENCHBOT_ADDRESS")]
    address: Option<String>,
    /// Only serve while holding the cluster lease
    #[arg(long, env = "BENCHBOT_ENABLE_LEADER_ELECTION")]
    enable_leader_election: bool,
    #[arg(long, env = "BENCHBOT_GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,
    #[arg(long, env = "BENCHBOT_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let file = File::open(&args.config)
        .with_context(|| format!("Failed to open config file {}", args.config.display()))?;
    let mut config: Config =
        serde_yaml::from_reader(BufReader::new(file)).context("Failed to parse config file")?;
    if let Some(address) = &args.address {
        config.server.address = address.clone();
    }
    if args.enable_leader_election {
        config.leader_election.enabled = true;
    }
    if let Some(token) = &args.github_token {
        config.github.token = token.clone();
    }
    if let Some(secret) = &args.webhook_secret {
        config.github.webhook_secret = secret.clone();
    }
    config.finalize().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let args = Args::parse();
    let config = Arc::new(load_config(&args)?);
    let db = Database::new(&config.db).await?;
    let github = GitHub::new(&config.github).await?;

    let mut registry = Registry::new();
    register_all(&mut registry);
    tracing::info!("Loaded plugins: {}", registry.names().collect::<Vec<_>>().join(", "));

    let store: Arc<dyn MetaStore> = Arc::new(db.clone());
    let agent = Arc::new(Agent::new(&config, github, store.clone()));
    let services =
        server::Services { config: config.clone(), registry: Arc::new(registry), agent, store };

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                trigger.trigger();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {e}"),
        }
    });

    let result = if config.leader_election.enabled {
        server::run_elected(&services, &db, shutdown).await
    } else {
        server::serve(&services, shutdown).await
    };
    if let Err(e) = &result {
        tracing::error!("{e:?}");
    }

    db.close().await;
    tracing::info!("Shut down gracefully");
    result
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> =
        vec![header::AUTHORIZATION, HeaderName::from_static("x-hub-signature-256")].into();
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(RequestSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(NormalizePathLayer::trim_trailing_slash())
        .compression();
    build_router().with_state(state).layer(middleware)
}

#[derive(Debug, Clone)]
pub struct RequestSpan {
    level: Level,
}

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let delivery = request
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    delivery = %delivery,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
