use benchbot_core::{
    config::StorageConfig,
    models::{DispatchKind, STATUS_PENDING, StoreKey},
    util::unix_now,
};
use benchbot_github::{DispatchPayload, webhook::IssueCommentEvent};

use crate::{
    Agent, Dispatched, PipelineError, PluginContext,
    auth::verify_author,
    command::{CommandMatch, CommandSet, RefArg},
    poll::wait_for_status,
};

pub const CURRENT_BRANCH: &str = "CURRENT_BRANCH";
pub const REF_BRANCH: &str = "REF_BRANCH";
pub const REF: &str = "REF";
pub const PR_NUMBER: &str = "PR_NUMBER";
pub const LAST_COMMIT_SHA: &str = "LAST_COMMIT_SHA";
pub const STATUS_COMMIT_SHA: &str = "STATUS_COMMIT_SHA";
pub const START_TIME: &str = "START_TIME";
pub const UUID: &str = "UUID";
pub const REGION: &str = "REGION";
pub const BUCKET: &str = "BUCKET";
pub const ENDPOINT: &str = "ENDPOINT";

/// Values fetched or generated for one run, fixed before any planning happens.
#[derive(Debug, Clone)]
pub struct RunInputs<'a> {
    pub sha: &'a str,
    pub latest_tag: Option<&'a str>,
    pub start_time: u64,
    pub uuid: &'a str,
}

/// One `build-docker` dispatch and the record that reports its completion.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildStep {
    pub reference: String,
    pub payload: DispatchPayload,
    pub status_key: StoreKey,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BenchmarkPlan {
    pub kind: DispatchKind,
    pub current: BuildStep,
    pub reference: BuildStep,
    pub payload: DispatchPayload,
}

pub fn resolve_ref(
    arg: &RefArg,
    event: &IssueCommentEvent,
    inputs: &RunInputs,
) -> Result<String, PipelineError> {
    match arg {
        RefArg::Latest => inputs.latest_tag.map(str::to_string).ok_or_else(|| {
            PipelineError::NoTags { owner: event.owner.clone(), repo: event.repo.clone() }
        }),
        RefArg::Current => Ok(inputs.sha.to_string()),
        RefArg::Named(name) => Ok(name.clone()),
    }
}

/// The single `build-docker` dispatch for `reference`.
///
/// The build worker reports back with `commitSHA` set to `STATUS_COMMIT_SHA` and
/// `uuid` set to `UUID`, which together address `status_key`.
pub fn plan_build(
    reference: &str,
    event: &IssueCommentEvent,
    inputs: &RunInputs,
) -> Result<BuildStep, PipelineError> {
    let pr = event.number.to_string();
    // The built ref sits in the commit position so both branches of one run get
    // their own record.
    let status_key = StoreKey::status(
        DispatchKind::BuildDocker,
        &event.owner,
        &event.repo,
        &pr,
        reference,
        inputs.uuid,
    )?;
    let payload = DispatchPayload::from([
        (REF.to_string(), reference.to_string()),
        (PR_NUMBER.to_string(), pr),
        (LAST_COMMIT_SHA.to_string(), inputs.sha.to_string()),
        (STATUS_COMMIT_SHA.to_string(), reference.to_string()),
        (UUID.to_string(), inputs.uuid.to_string()),
    ]);
    Ok(BuildStep { reference: reference.to_string(), payload, status_key })
}

/// Everything a benchmark run dispatches, derived only from its inputs.
pub fn plan_benchmark(
    kind: DispatchKind,
    command: &CommandMatch,
    event: &IssueCommentEvent,
    inputs: &RunInputs,
    storage: &StorageConfig,
) -> Result<BenchmarkPlan, PipelineError> {
    let reference = resolve_ref(&command.reference, event, inputs)?;
    let current = plan_build(inputs.sha, event, inputs)?;
    let reference = plan_build(&reference, event, inputs)?;

    let mut payload = DispatchPayload::from([
        (CURRENT_BRANCH.to_string(), current.reference.clone()),
        (REF_BRANCH.to_string(), reference.reference.clone()),
        (PR_NUMBER.to_string(), event.number.to_string()),
        (LAST_COMMIT_SHA.to_string(), inputs.sha.to_string()),
        (START_TIME.to_string(), inputs.start_time.to_string()),
        (UUID.to_string(), inputs.uuid.to_string()),
    ]);
    for (name, value) in
        [(REGION, &storage.region), (BUCKET, &storage.bucket), (ENDPOINT, &storage.endpoint)]
    {
        if let Some(value) = value {
            payload.insert(name.to_string(), value.clone());
        }
    }
    Ok(BenchmarkPlan { kind, current, reference, payload })
}

/// Match, authorize and fetch the commit SHA. Posts the rejection comment for
/// unauthorized authors.
async fn admit(
    ctx: &PluginContext,
    plugin: &str,
    commands: &CommandSet,
) -> Result<(CommandMatch, String), PipelineError> {
    let event = &ctx.event;
    let Some(command) = commands.find(&event.body) else {
        return Err(PipelineError::NoMatch);
    };
    if let Err(err) = verify_author(&event.author, &event.author_association, plugin) {
        ctx.agent
            .github
            .post_comment(&event.owner, &event.repo, event.number, &err.to_string())
            .await
            .map_err(PipelineError::Comment)?;
        return Err(err);
    }
    tracing::info!("{} requested {} on {}", event.author, command.name, command.reference);
    let sha = ctx
        .agent
        .github
        .last_commit_sha(&event.owner, &event.repo, event.number)
        .await
        .map_err(|source| PipelineError::Lookup {
            what: format!("head commit of #{}", event.number),
            source,
        })?;
    Ok((command, sha))
}

async fn latest_tag(
    agent: &Agent,
    event: &IssueCommentEvent,
    reference: &RefArg,
) -> Result<Option<String>, PipelineError> {
    if *reference != RefArg::Latest {
        return Ok(None);
    }
    agent.github.latest_tag(&event.owner, &event.repo).await.map_err(|source| {
        PipelineError::Lookup { what: format!("latest tag of {}/{}", event.owner, event.repo), source }
    })
}

/// Nothing new is dispatched once shutdown has begun.
fn ensure_running(ctx: &PluginContext, key: &StoreKey) -> Result<(), PipelineError> {
    if ctx.shutdown.is_triggered() {
        return Err(PipelineError::Cancelled { key: key.to_path() });
    }
    Ok(())
}

async fn dispatch(
    agent: &Agent,
    event: &IssueCommentEvent,
    kind: DispatchKind,
    reference: &str,
    payload: &DispatchPayload,
) -> Result<(), PipelineError> {
    agent.github.create_dispatch(&event.owner, &event.repo, kind.as_str(), payload).await.map_err(
        |source| PipelineError::Dispatch { event_type: kind, reference: reference.to_string(), source },
    )
}

/// Single stage: dispatch one image build and stop.
pub async fn run_build(
    ctx: PluginContext,
    plugin: &str,
    commands: &CommandSet,
) -> Result<Dispatched, PipelineError> {
    let (command, sha) = admit(&ctx, plugin, commands).await?;
    let event = &ctx.event;
    let tag = latest_tag(&ctx.agent, event, &command.reference).await?;
    let uuid = uuid::Uuid::new_v4().to_string();
    let inputs =
        RunInputs { sha: &sha, latest_tag: tag.as_deref(), start_time: unix_now(), uuid: &uuid };
    let reference = resolve_ref(&command.reference, event, &inputs)?;
    let step = plan_build(&reference, event, &inputs)?;
    tracing::info!("Building image for {}", step.reference);
    ensure_running(&ctx, &step.status_key)?;
    dispatch(&ctx.agent, event, DispatchKind::BuildDocker, &step.reference, &step.payload).await?;
    Ok(Dispatched { kind: DispatchKind::BuildDocker, uuid, payload: step.payload })
}

/// Two stages: build both branches, wait for both images, then dispatch the benchmark.
pub async fn run_benchmark(
    ctx: PluginContext,
    plugin: &str,
    commands: &CommandSet,
    kind_for: impl Fn(&CommandMatch) -> DispatchKind,
) -> Result<Dispatched, PipelineError> {
    let (command, sha) = admit(&ctx, plugin, commands).await?;
    let agent = ctx.agent.as_ref();
    let event = ctx.event.as_ref();
    let tag = latest_tag(agent, event, &command.reference).await?;
    let uuid = uuid::Uuid::new_v4().to_string();
    let inputs =
        RunInputs { sha: &sha, latest_tag: tag.as_deref(), start_time: unix_now(), uuid: &uuid };
    let plan = plan_benchmark(kind_for(&command), &command, event, &inputs, &agent.storage)?;
    tracing::info!(
        uuid = %uuid,
        "Current branch {}, reference branch {}",
        plan.current.reference,
        plan.reference.reference
    );

    for step in [&plan.current, &plan.reference] {
        ensure_running(&ctx, &step.status_key)?;
        dispatch(agent, event, DispatchKind::BuildDocker, &step.reference, &step.payload).await?;
    }
    tokio::try_join!(
        wait_for_status(
            agent.store.as_ref(),
            &plan.current.status_key,
            &agent.poll,
            ctx.shutdown.clone()
        ),
        wait_for_status(
            agent.store.as_ref(),
            &plan.reference.status_key,
            &agent.poll,
            ctx.shutdown.clone()
        ),
    )?;

    let pr = event.number.to_string();
    let pending = StoreKey::status(plan.kind, &event.owner, &event.repo, &pr, &sha, &uuid)?;
    ensure_running(&ctx, &pending)?;
    dispatch(agent, event, plan.kind, &plan.reference.reference, &plan.payload).await?;
    let ack = format!(
        "run performance on sha {} reference on {}",
        plan.current.reference, plan.reference.reference
    );
    if let Err(e) = agent.github.post_comment(&event.owner, &event.repo, event.number, &ack).await
    {
        tracing::warn!("Failed to acknowledge {} on #{}: {:?}", plan.kind, event.number, e);
    }
    agent
        .store
        .put_if_absent(&pending, STATUS_PENDING.as_bytes())
        .await
        .map_err(|source| PipelineError::Store { key: pending.to_path(), source })?;
    Ok(Dispatched { kind: plan.kind, uuid, payload: plan.payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{comment, storage};

    fn inputs<'a>(tag: Option<&'a str>) -> RunInputs<'a> {
        RunInputs { sha: "foo", latest_tag: tag, start_time: 1_700_000_000, uuid: "uuid1" }
    }

    fn matched(reference: RefArg) -> CommandMatch { CommandMatch { name: "run_perf", reference } }

    #[test]
    fn test_plan_benchmark_payload() {
        let event = comment("/run-perf master", "OWNER");
        let plan = plan_benchmark(
            DispatchKind::RunPerf,
            &matched(RefArg::Named("master".to_string())),
            &event,
            &inputs(None),
            &storage(),
        )
        .unwrap();
        let expected: &[(&str, &str)] = &[
            ("BUCKET", "perf"),
            ("CURRENT_BRANCH", "foo"),
            ("ENDPOINT", "https://s3.us-east-2.amazonaws.com"),
            ("LAST_COMMIT_SHA", "foo"),
            ("PR_NUMBER", "42"),
            ("REF_BRANCH", "master"),
            ("REGION", "us-east-2"),
            ("START_TIME", "1700000000"),
            ("UUID", "uuid1"),
        ];
        let actual =
            plan.payload.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect::<Vec<_>>();
        assert_eq!(actual, expected);

        assert_eq!(
            plan.current.status_key.to_path(),
            "build-docker/datafuselabs/databend/42/foo/uuid1"
        );
        assert_eq!(
            plan.reference.status_key.to_path(),
            "build-docker/datafuselabs/databend/42/master/uuid1"
        );
        assert_eq!(plan.reference.payload[REF], "master");
        assert_eq!(plan.reference.payload[LAST_COMMIT_SHA], "foo");
        for step in [&plan.current, &plan.reference] {
            let key = StoreKey::status(
                DispatchKind::BuildDocker,
                "datafuselabs",
                "databend",
                &step.payload[PR_NUMBER],
                &step.payload[STATUS_COMMIT_SHA],
                &step.payload[UUID],
            )
            .unwrap();
            assert_eq!(key, step.status_key);
        }
    }

    #[test]
    fn test_plan_is_pure() {
        let event = comment("/run-perf latest", "MEMBER");
        let command = matched(RefArg::Latest);
        let plan = || {
            let inputs = inputs(Some("v1.0.0"));
            plan_benchmark(DispatchKind::RunPerf, &command, &event, &inputs, &storage()).unwrap()
        };
        assert_eq!(plan(), plan());
    }

    #[test]
    fn test_resolve_ref() {
        let event = comment("", "OWNER");
        let cases: &[(RefArg, Option<&str>, Option<&str>)] = &[
            (RefArg::Latest, Some("v0.9.1"), Some("v0.9.1")),
            (RefArg::Latest, None, None),
            (RefArg::Current, Some("v0.9.1"), Some("foo")),
            (RefArg::Named("main".to_string()), None, Some("main")),
            (RefArg::Named("v1.2.3-rc1".to_string()), None, Some("v1.2.3-rc1")),
        ];
        for (arg, tag, expected) in cases {
            let actual = resolve_ref(arg, &event, &inputs(*tag)).ok();
            assert_eq!(actual.as_deref(), *expected, "{arg:?}");
        }
    }

    #[test]
    fn test_storage_coordinates_optional() {
        let event = comment("", "OWNER");
        let plan = plan_benchmark(
            DispatchKind::RerunPerf,
            &matched(RefArg::Current),
            &event,
            &inputs(None),
            &StorageConfig::default(),
        )
        .unwrap();
        assert!(!plan.payload.contains_key(REGION));
        assert!(!plan.payload.contains_key(ENDPOINT));
        assert_eq!(plan.payload[REF_BRANCH], "foo");
    }
}
