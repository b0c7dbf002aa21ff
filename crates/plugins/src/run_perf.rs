use std::sync::OnceLock;

use benchbot_core::models::DispatchKind;

use crate::{
    HandlerResult, PluginContext, Registry,
    command::{CommandMatch, CommandSet},
    pipeline::run_benchmark,
};

pub const PLUGIN_NAME: &str = "run-perf";

fn commands() -> &'static CommandSet {
    static COMMANDS: OnceLock<CommandSet> = OnceLock::new();
    COMMANDS.get_or_init(|| {
        CommandSet::new()
            .with("run_perf", "run-perf")
            .and_then(|c| c.with("rerun_perf", "rerun-perf"))
            .and_then(|c| c.with("rerun_perf_all", "rerun-perf-all"))
            .unwrap()
    })
}

fn benchmark_kind(command: &CommandMatch) -> DispatchKind {
    match command.name {
        "rerun_perf" => DispatchKind::RerunPerf,
        "rerun_perf_all" => DispatchKind::RerunPerfAll,
        _ => DispatchKind::RunPerf,
    }
}

pub async fn handle(ctx: PluginContext) -> HandlerResult {
    run_benchmark(ctx, PLUGIN_NAME, commands(), benchmark_kind).await
}

pub fn register(registry: &mut Registry) { registry.register(PLUGIN_NAME, handle) }

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use benchbot_core::shutdown::{self, Shutdown};
    use tokio::time::Instant;

    use super::*;
    use benchbot_github::DispatchPayload;

    use crate::{
        PipelineError,
        testing::{Call, FakeGitHub, MemoryStore, agent, comment},
    };

    const CURRENT_KEY: &str = "build-docker/datafuselabs/databend/42/foo/";

    fn context(
        github: &Arc<FakeGitHub>,
        store: &Arc<MemoryStore>,
        body: &str,
        association: &str,
    ) -> PluginContext {
        PluginContext {
            agent: agent(github.clone(), store.clone()),
            event: Arc::new(comment(body, association)),
            shutdown: Shutdown::never(),
        }
    }

    /// Wait until the two build dispatches went out and return their run UUID.
    async fn build_uuid(github: &FakeGitHub) -> String {
        loop {
            let dispatches = github.dispatches();
            if dispatches.len() >= 2 {
                return dispatches[0].1["UUID"].clone();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Record a build result the way the CI worker does, echoing its dispatch payload.
    fn report_build(store: &MemoryStore, payload: &DispatchPayload, status: &str) {
        let key = format!(
            "build-docker/datafuselabs/databend/{}/{}/{}",
            payload["PR_NUMBER"], payload["STATUS_COMMIT_SHA"], payload["UUID"]
        );
        store.set(&key, status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_comments_dispatch_nothing() {
        let github = Arc::new(FakeGitHub::new("foo", None));
        let store = Arc::new(MemoryStore::default());
        for body in ["lgtm", "/run-perf develop", "/build-docker master", "/run-perf master please"] {
            let err = handle(context(&github, &store, body, "OWNER")).await.unwrap_err();
            assert!(matches!(err, PipelineError::NoMatch), "{body}: {err:?}");
        }
        assert!(github.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_author_is_rejected() {
        let github = Arc::new(FakeGitHub::new("foo", None));
        let store = Arc::new(MemoryStore::default());
        let err = handle(context(&github, &store, "/run-perf master", "NONE")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Unauthorized { ref author, .. } if author == "alice"));
        assert_eq!(github.calls(), [Call::Comment {
            number: 42,
            body: "@alice is not an owner, member nor a collaborator and cannot run run-perf."
                .to_string(),
        }]);
        assert!(store.entries.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_benchmark_waits_for_both_builds() {
        let github = Arc::new(FakeGitHub::new("foo", None));
        let store = Arc::new(MemoryStore::default());
        let run = tokio::spawn(handle(context(&github, &store, "/run-perf master", "OWNER")));

        let uuid = build_uuid(&github).await;
        let builds = github.dispatches();
        assert_eq!(builds.iter().map(|(e, p)| (e.as_str(), p["REF"].as_str())).collect::<Vec<_>>(), [
            ("build-docker", "foo"),
            ("build-docker", "master"),
        ]);

        assert_eq!(builds[1].1["STATUS_COMMIT_SHA"], "master");
        report_build(&store, &builds[0].1, "SUCCESS");
        tokio::time::sleep(Duration::from_secs(120)).await;
        // Only one branch is ready.
        assert_eq!(github.dispatches().len(), 2);
        assert!(!run.is_finished());

        report_build(&store, &builds[1].1, "SUCCESS");
        let dispatched = run.await.unwrap().unwrap();
        assert_eq!(dispatched.kind, DispatchKind::RunPerf);
        assert_eq!(dispatched.uuid, uuid);
        assert_eq!(dispatched.payload["CURRENT_BRANCH"], "foo");
        assert_eq!(dispatched.payload["REF_BRANCH"], "master");
        assert_eq!(dispatched.payload["PR_NUMBER"], "42");

        let dispatches = github.dispatches();
        assert_eq!(dispatches.len(), 3);
        assert_eq!(dispatches[2], ("run-perf".to_string(), dispatched.payload.clone()));
        assert_eq!(github.comments(), ["run performance on sha foo reference on master"]);
        assert_eq!(
            store.value(&format!("run-perf/datafuselabs/databend/42/foo/{uuid}")).as_deref(),
            Some("pending")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_timeout_abandons_run() {
        let github = Arc::new(FakeGitHub::new("foo", None));
        let store = Arc::new(MemoryStore::default());
        let run = tokio::spawn(handle(context(&github, &store, "/run-perf master", "MEMBER")));
        let uuid = build_uuid(&github).await;
        store.set(&format!("{CURRENT_KEY}{uuid}"), "SUCCESS");

        let start = Instant::now();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { attempts: 180, .. }), "{err:?}");
        assert!(start.elapsed() <= Duration::from_secs(180 * 10));
        assert_eq!(github.dispatches().len(), 2);
        assert!(github.comments().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_and_rerun_variants() {
        let github = Arc::new(FakeGitHub::new("foo", Some("v0.9.41-nightly")));
        let store = Arc::new(MemoryStore::default());
        let ctx = context(&github, &store, "/rerun-perf-all latest", "COLLABORATOR");
        let run = tokio::spawn(handle(ctx));
        let uuid = build_uuid(&github).await;
        store.set(&format!("{CURRENT_KEY}{uuid}"), "SUCCESS");
        store.set(&format!("build-docker/datafuselabs/databend/42/v0.9.41-nightly/{uuid}"), "SUCCESS");
        let dispatched = run.await.unwrap().unwrap();
        assert_eq!(dispatched.kind, DispatchKind::RerunPerfAll);
        assert_eq!(dispatched.payload["REF_BRANCH"], "v0.9.41-nightly");
        assert_eq!(github.dispatches()[2].0, "rerun-perf-all");
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_without_tags_fails_before_dispatch() {
        let github = Arc::new(FakeGitHub::new("foo", None));
        let store = Arc::new(MemoryStore::default());
        let err = handle(context(&github, &store, "/run-perf latest", "OWNER")).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoTags { .. }), "{err:?}");
        assert!(github.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_stops_pipeline() {
        let github = Arc::new(FakeGitHub {
            fail_dispatch: Some("build-docker".to_string()),
            ..FakeGitHub::new("foo", None)
        });
        let store = Arc::new(MemoryStore::default());
        let err = handle(context(&github, &store, "/run-perf main", "OWNER")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Dispatch { event_type: DispatchKind::BuildDocker, .. }));
        assert!(github.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_dispatch_after_shutdown() {
        let github = Arc::new(FakeGitHub::new("foo", None));
        let store = Arc::new(MemoryStore::default());
        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();
        let ctx = PluginContext { shutdown, ..context(&github, &store, "/run-perf master", "OWNER") };
        let err = handle(ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { ref key } if key.starts_with(CURRENT_KEY)));
        assert!(github.dispatches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_skips_benchmark() {
        let github = Arc::new(FakeGitHub::new("foo", None));
        let store = Arc::new(MemoryStore::default());
        let (trigger, shutdown) = shutdown::channel();
        let ctx = PluginContext { shutdown, ..context(&github, &store, "/run-perf master", "OWNER") };
        let run = tokio::spawn(handle(ctx));
        let uuid = build_uuid(&github).await;
        store.set(&format!("{CURRENT_KEY}{uuid}"), "SUCCESS");

        trigger.trigger();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { .. }), "{err:?}");
        assert_eq!(github.dispatches().len(), 2);
        assert!(github.comments().is_empty());
        assert_eq!(store.value(&format!("run-perf/datafuselabs/databend/42/foo/{uuid}")), None);
    }
}
