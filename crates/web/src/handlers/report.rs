use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use benchbot_core::{
    AppError,
    models::{REPORT_PREFIX, StoreKey},
};
use benchbot_db::{MetaStore, Order};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

#[derive(Deserialize)]
pub struct ReportQuery {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct ReportEntry {
    key: String,
    report: Value,
}

/// Stored benchmark reports, newest start time first.
pub async fn list_reports(
    State(store): State<Arc<dyn MetaStore>>,
    Query(query): Query<ReportQuery>,
) -> Result<Response, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let prefix = StoreKey::new([REPORT_PREFIX])?;
    let records = store.list_prefix(&prefix, Order::Descending, Some(limit)).await?;
    let reports = records
        .into_iter()
        .map(|record| {
            // Reports are stored verbatim; keep anything that is not JSON as a string.
            let report = serde_json::from_slice(&record.value).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&record.value).into_owned())
            });
            ReportEntry { key: record.key, report }
        })
        .collect::<Vec<_>>();
    Ok(Json(reports).into_response())
}
