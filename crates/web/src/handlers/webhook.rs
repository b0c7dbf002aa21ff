use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use benchbot_core::AppError;
use benchbot_github::webhook::{GitHubEvent, WebhookEvent};
use benchbot_plugins::dispatcher::Dispatcher;

/// Hands issue comments to the plugins and acknowledges everything else.
///
/// Returns as soon as the plugins are scheduled; their outcome is only logged.
pub async fn webhook(
    State(dispatcher): State<Arc<Dispatcher>>,
    GitHubEvent { delivery, event }: GitHubEvent,
) -> Result<Response, AppError> {
    match event {
        WebhookEvent::IssueCommentCreated(comment) => {
            tracing::info!(
                delivery = ?delivery,
                "Received comment on {}/{}#{} from @{} ({})",
                comment.owner,
                comment.repo,
                comment.number,
                comment.author,
                comment.author_association
            );
            if dispatcher.is_shut_down() {
                return Err(AppError::Status(StatusCode::SERVICE_UNAVAILABLE));
            }
            let scheduled = dispatcher.dispatch(comment);
            Ok((StatusCode::OK, format!("Scheduled {scheduled} plugins")).into_response())
        }
        WebhookEvent::Other(kind) => {
            tracing::debug!(delivery = ?delivery, "Ignoring webhook event {kind}");
            Ok((StatusCode::OK, "Event ignored").into_response())
        }
    }
}
