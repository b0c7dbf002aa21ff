use std::{fmt::Display, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use benchbot_core::{config::Config, models::AuthorAssociation};
use hmac::{Hmac, Mac};
use octocrab::models::webhook_events::{
    WebhookEventPayload,
    payload::{IssueCommentWebhookEventAction, IssueCommentWebhookEventPayload},
};
use serde::{Serialize, de::Error as _};
use sha2::Sha256;

/// Verify and extract GitHub Event Payload.
#[derive(Debug, Clone)]
#[must_use]
pub struct GitHubEvent {
    pub delivery: Option<String>,
    pub event: WebhookEvent,
}

/// The events the bot reacts to. Everything else is acknowledged and dropped.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WebhookEvent {
    IssueCommentCreated(IssueCommentEvent),
    Other(String),
}

/// A newly created comment on an issue or pull request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IssueCommentEvent {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub author: String,
    pub author_association: AuthorAssociation,
    pub body: String,
    pub state: String,
    pub is_pull_request: bool,
}

impl WebhookEvent {
    /// Decode a delivery by its `X-GitHub-Event` kind. Only comment payloads are
    /// parsed; every other kind is acknowledged unread.
    pub fn try_from_header_and_body(event: &str, body: &[u8]) -> serde_json::Result<Self> {
        if event != "issue_comment" {
            return Ok(Self::Other(event.to_string()));
        }
        let envelope = octocrab::models::webhook_events::WebhookEvent::try_from_header_and_body(
            event, body,
        )?;
        let WebhookEventPayload::IssueComment(inner) = envelope.specific else {
            return Ok(Self::Other(event.to_string()));
        };
        if inner.action != IssueCommentWebhookEventAction::Created {
            return Ok(Self::Other(format!("{event}.{}", wire_name(&inner.action)?)));
        }
        let repository =
            envelope.repository.ok_or_else(|| serde_json::Error::missing_field("repository"))?;
        let owner =
            repository.owner.ok_or_else(|| serde_json::Error::missing_field("repository.owner"))?;
        let IssueCommentWebhookEventPayload { comment, issue, .. } = *inner;
        Ok(Self::IssueCommentCreated(IssueCommentEvent {
            owner: owner.login,
            repo: repository.name,
            number: issue.number,
            author: comment.user.login,
            author_association: AuthorAssociation::from(wire_name(&comment.author_association)?),
            body: comment.body.unwrap_or_default(),
            state: wire_name(&issue.state)?,
            is_pull_request: issue.pull_request.is_some(),
        }))
    }
}

/// The string form GitHub uses on the wire for a unit enum value.
fn wire_name<T: Serialize>(value: &T) -> serde_json::Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

/// Check a `sha256=<hex>` signature header against the body.
pub fn verify_signature(secret: &[u8], header: &str, body: &[u8]) -> Result<(), &'static str> {
    if secret.is_empty() {
        return Err("webhook secret not configured");
    }
    let signature_sha256 =
        header.strip_prefix("sha256=").ok_or("X-Hub-Signature-256 sha256= prefix missing")?;
    let signature = hex::decode(signature_sha256).map_err(|_| "X-Hub-Signature-256 malformed")?;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).map_err(|_| "webhook secret unusable as HMAC key")?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| "signature mismatch")
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn reject(status: StatusCode, m: impl Display) -> Response {
            tracing::warn!("Rejected webhook: {m}");
            (status, m.to_string()).into_response()
        }
        let config = <Arc<Config>>::from_ref(state);
        let signature = req
            .headers()
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "X-Hub-Signature-256 missing"))?
            .to_string();
        let event = req
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let delivery = req
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| reject(StatusCode::BAD_REQUEST, "error reading body"))?;
        // Authenticity first: nothing about the payload is trusted before this.
        verify_signature(config.github.webhook_secret.as_bytes(), &signature, &body)
            .map_err(|m| reject(StatusCode::UNAUTHORIZED, m))?;
        let event =
            event.ok_or_else(|| reject(StatusCode::BAD_REQUEST, "X-GitHub-Event header missing"))?;
        let event = WebhookEvent::try_from_header_and_body(&event, &body)
            .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("error parsing body: {e}")))?;
        Ok(GitHubEvent { delivery, event })
    }
}

/// `sha256=<hex>` signature for `body`, as GitHub computes it.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
