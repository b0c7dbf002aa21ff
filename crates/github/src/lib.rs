pub mod webhook;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use benchbot_core::{config::GitHubConfig, util::api_url};
use octocrab::Octocrab;
use serde::Serialize;

/// Flat string map sent as a repository dispatch `client_payload`.
pub type DispatchPayload = BTreeMap<String, String>;

/// The outbound calls the bot makes against the code hosting provider.
#[async_trait]
pub trait RepoClient: Send + Sync {
    async fn post_comment(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<()>;

    /// Head commit SHA of a pull request.
    async fn last_commit_sha(&self, owner: &str, repo: &str, number: u64) -> Result<String>;

    /// Name of the most recent tag, if the repository has any.
    async fn latest_tag(&self, owner: &str, repo: &str) -> Result<Option<String>>;

    async fn create_dispatch(
        &self,
        owner: &str,
        repo: &str,
        event_type: &str,
        payload: &DispatchPayload,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
    http: reqwest::Client,
    token: String,
    api_url: String,
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    event_type: &'a str,
    client_payload: &'a DispatchPayload,
}

impl GitHub {
    pub async fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let client = Octocrab::builder()
            .base_uri(config.api_url.as_str())
            .context("Invalid GitHub API URL")?
            .personal_token(config.token.clone())
            .build()
            .context("Failed to create GitHub client")?;
        match client.current().user().await {
            Ok(profile) => tracing::info!("Logged in as {}", profile.login),
            Err(e) => tracing::warn!("Failed to fetch current user: {e}"),
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("benchbot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Arc::new(Self {
            client,
            http,
            token: config.token.clone(),
            api_url: config.api_url.clone(),
        }))
    }
}

#[async_trait]
impl RepoClient for GitHub {
    async fn post_comment(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<()> {
        self.client
            .issues(owner, repo)
            .create_comment(number, body)
            .await
            .with_context(|| format!("Failed to comment on {owner}/{repo}#{number}"))?;
        Ok(())
    }

    async fn last_commit_sha(&self, owner: &str, repo: &str, number: u64) -> Result<String> {
        let pull = self
            .client
            .pulls(owner, repo)
            .get(number)
            .await
            .with_context(|| format!("Failed to fetch pull request {owner}/{repo}#{number}"))?;
        Ok(pull.head.sha)
    }

    async fn latest_tag(&self, owner: &str, repo: &str) -> Result<Option<String>> {
        let page = self
            .client
            .repos(owner, repo)
            .list_tags()
            .per_page(1)
            .send()
            .await
            .with_context(|| format!("Failed to list tags for {owner}/{repo}"))?;
        Ok(page.items.into_iter().next().map(|tag| tag.name))
    }

    async fn create_dispatch(
        &self,
        owner: &str,
        repo: &str,
        event_type: &str,
        payload: &DispatchPayload,
    ) -> Result<()> {
        let url = api_url(&self.api_url, &format!("repos/{owner}/{repo}/dispatches"))?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&DispatchRequest { event_type, client_payload: payload })
            .send()
            .await
            .with_context(|| format!("Failed to send {event_type} dispatch to {owner}/{repo}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{event_type} dispatch to {owner}/{repo} failed: {status} {text}");
        }
        tracing::info!("Dispatched {} to {}/{}", event_type, owner, repo);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_request_shape() {
        let payload = DispatchPayload::from([
            ("PR_NUMBER".to_string(), "42".to_string()),
            ("UUID".to_string(), "u".to_string()),
        ]);
        let value =
            serde_json::to_value(DispatchRequest { event_type: "run-perf", client_payload: &payload })
                .unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "event_type": "run-perf",
                "client_payload": {"PR_NUMBER": "42", "UUID": "u"}
            })
        );
    }
}
