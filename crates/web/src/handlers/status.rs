use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use benchbot_core::{
    AppError,
    models::{DispatchKind, StatusUpdate, StoreKey},
};
use benchbot_db::MetaStore;

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, AppError> {
    match value.as_deref() {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::BadRequest(format!("{field} is required"))),
    }
}

/// Completion callback from the CI workflows.
///
/// Records the run's status under its status key; benchmark runs also keep the whole
/// body under a report key.
pub async fn status(
    State(store): State<Arc<dyn MetaStore>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let update: StatusUpdate = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid status body: {e}")))?;
    let name = required(&update.dispatch_name, "dispatch_name")?;
    let kind = name
        .parse::<DispatchKind>()
        .map_err(|()| AppError::BadRequest(format!("Unknown dispatch_name {name:?}")))?;
    let org = required(&update.org, "org")?;
    let repo = required(&update.repo, "repo")?;
    let pr = required(&update.pr, "pr")?;
    let commit = required(&update.commit_sha, "commitSHA")?;
    let uuid = required(&update.uuid, "uuid")?;

    let key = StoreKey::status(kind, org, repo, pr, commit, uuid)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let report = if kind.is_benchmark() {
        let start_time = required(&update.start_time, "start_time")?;
        let report = StoreKey::report(start_time, org, repo, pr, commit, uuid)
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        Some(report)
    } else {
        None
    };

    let value = update.status.as_deref().unwrap_or_default();
    store.put(&key, value.as_bytes()).await?;
    tracing::info!("Recorded {:?} for {}", value, key);
    if let Some(report) = report {
        store.put(&report, &body).await?;
        tracing::info!("Stored report {}", report);
    }
    Ok(StatusCode::OK.into_response())
}
