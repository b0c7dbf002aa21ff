pub mod auth;
pub mod build_docker;
pub mod command;
pub mod dispatcher;
pub mod pipeline;
pub mod poll;
pub mod run_perf;

use std::{collections::BTreeMap, future::Future, sync::Arc};

use benchbot_core::{
    config::{Config, StorageConfig},
    models::{DispatchKind, KeyError},
    shutdown::Shutdown,
};
use benchbot_db::MetaStore;
use benchbot_github::{DispatchPayload, RepoClient, webhook::IssueCommentEvent};
use futures_util::{FutureExt, future::BoxFuture};

use crate::poll::PollConfig;

/// Shared collaborators handed to every plugin invocation.
pub struct Agent {
    pub github: Arc<dyn RepoClient>,
    pub store: Arc<dyn MetaStore>,
    pub poll: PollConfig,
    pub storage: StorageConfig,
}

impl Agent {
    pub fn new(config: &Config, github: Arc<dyn RepoClient>, store: Arc<dyn MetaStore>) -> Self {
        Self {
            github,
            store,
            poll: PollConfig::from(&config.pipeline),
            storage: config.storage.clone(),
        }
    }
}

/// Everything a single handler invocation gets to work with.
#[derive(Clone)]
pub struct PluginContext {
    pub agent: Arc<Agent>,
    pub event: Arc<IssueCommentEvent>,
    /// Fires when the dispatcher that spawned this invocation shuts down.
    pub shutdown: Shutdown,
}

/// A completed dispatch.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Dispatched {
    pub kind: DispatchKind,
    pub uuid: String,
    pub payload: DispatchPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("@{author} is not an owner, member nor a collaborator and cannot run {plugin}.")]
    Unauthorized { author: String, plugin: String },
    #[error("there is no matching command")]
    NoMatch,
    #[error("{owner}/{repo} has no tags to resolve `latest` against")]
    NoTags { owner: String, repo: String },
    #[error("failed to look up {what}")]
    Lookup {
        what: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{event_type} dispatch for {reference} failed")]
    Dispatch {
        event_type: DispatchKind,
        reference: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to post comment")]
    Comment(#[source] anyhow::Error),
    #[error("{key} did not report SUCCESS after {attempts} attempts")]
    Timeout { key: String, attempts: u32 },
    #[error("{key} reported FAILURE")]
    BuildFailed { key: String },
    #[error("store access for {key} failed")]
    Store {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("cancelled before {key} completed")]
    Cancelled { key: String },
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
}

pub type HandlerResult = Result<Dispatched, PipelineError>;

pub type Handler = Arc<dyn Fn(PluginContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Named issue comment handlers. Populated once at start-up, read-only afterwards.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: BTreeMap<String, Handler>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Register `handler` under `name`. A later registration under the same name replaces
    /// the earlier one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = name.into();
        let handler: Handler = Arc::new(move |ctx| handler(ctx).boxed());
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!("Replaced previously registered plugin {name}");
        } else {
            tracing::info!("Registered plugin {name}");
        }
    }

    pub fn len(&self) -> usize { self.handlers.len() }

    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }

    pub fn names(&self) -> impl Iterator<Item = &str> { self.handlers.keys().map(String::as_str) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Handler)> {
        self.handlers.iter().map(|(name, handler)| (name.as_str(), handler))
    }
}

/// Register every built-in plugin.
pub fn register_all(registry: &mut Registry) {
    run_perf::register(registry);
    build_docker::register(registry);
}
