use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

mod common;
mod report;
mod status;
mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/hello", get(common::hello))
        .route("/payload", post(webhook::webhook))
        .route("/status", post(status::status))
        .route("/api/reports", get(report::list_reports))
}
