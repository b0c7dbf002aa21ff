use std::{
    env,
    path::Path,
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, macros::format_description};

use crate::LeaseLock;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Lease {
    api_version: String,
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    spec: LeaseSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    holder_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acquire_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    renew_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_transitions: Option<i64>,
}

/// `MicroTime` as the API server expects it.
fn micro_time(t: OffsetDateTime) -> Result<String> {
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");
    t.to_offset(time::UtcOffset::UTC).format(&format).context("Failed to format lease time")
}

/// The last lease contents this replica saw and when it first saw them.
#[derive(Debug, Clone)]
struct Observation {
    spec: LeaseSpec,
    at: Instant,
}

/// Record `spec` as seen at `now` and return when its current contents were first
/// seen. The lease only counts as renewed when its contents change.
fn observe(slot: &mut Option<Observation>, spec: &LeaseSpec, now: Instant) -> Instant {
    match slot {
        Some(seen) if seen.spec == *spec => seen.at,
        _ => {
            *slot = Some(Observation { spec: spec.clone(), at: now });
            now
        }
    }
}

/// Whether `holder` may write the lease at `now`, given when its current contents
/// were first observed. Only the local monotonic clock is consulted, never the
/// holder's `renewTime`.
fn may_take(
    spec: &LeaseSpec,
    holder: &str,
    default_duration: Duration,
    observed_at: Instant,
    now: Instant,
) -> bool {
    let current = spec.holder_identity.as_deref().unwrap_or_default();
    if current.is_empty() || current == holder {
        return true;
    }
    let duration = spec
        .lease_duration_seconds
        .and_then(|secs| u64::try_from(secs).ok())
        .map_or(default_duration, Duration::from_secs);
    observed_at + duration <= now
}

/// Lease contents `holder` writes to take or renew it.
fn claim(
    spec: &LeaseSpec,
    holder: &str,
    lease_duration: Duration,
    now: OffsetDateTime,
) -> Result<LeaseSpec> {
    let now_str = micro_time(now)?;
    let renewing = spec.holder_identity.as_deref() == Some(holder);
    let transitions = spec.lease_transitions.unwrap_or_default();
    Ok(LeaseSpec {
        holder_identity: Some(holder.to_string()),
        lease_duration_seconds: Some(lease_duration.as_secs() as i64),
        acquire_time: if renewing { spec.acquire_time.clone() } else { Some(now_str.clone()) },
        renew_time: Some(now_str),
        lease_transitions: Some(if renewing || spec.holder_identity.is_none() {
            transitions
        } else {
            transitions + 1
        }),
    })
}

/// A `coordination.k8s.io/v1` Lease, reached through the in-cluster service account.
pub struct KubernetesLeaseLock {
    http: reqwest::Client,
    api_server: String,
    token: String,
    namespace: String,
    name: String,
    observed: Mutex<Option<Observation>>,
}

impl KubernetesLeaseLock {
    pub fn in_cluster(namespace: &str, name: &str) -> Result<Self> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST not set; not running in a cluster?")?;
        let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .context("Failed to read service account token")?;
        let ca = std::fs::read(dir.join("ca.crt")).context("Failed to read cluster CA")?;
        let http = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create Kubernetes client")?;
        let host = if host.contains(':') { format!("[{host}]") } else { host };
        Ok(Self::new(http, format!("https://{host}:{port}"), token.trim(), namespace, name))
    }

    pub fn new(
        http: reqwest::Client,
        api_server: String,
        token: &str,
        namespace: &str,
        name: &str,
    ) -> Self {
        Self {
            http,
            api_server,
            token: token.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            observed: Mutex::new(None),
        }
    }

    fn observe(&self, spec: &LeaseSpec, now: Instant) -> Instant {
        let mut observed = self.observed.lock().unwrap_or_else(|e| e.into_inner());
        observe(&mut observed, spec, now)
    }

    fn collection_url(&self) -> String {
        format!("{}/apis/coordination.k8s.io/v1/namespaces/{}/leases", self.api_server, self.namespace)
    }

    fn lease_url(&self) -> String { format!("{}/{}", self.collection_url(), self.name) }

    async fn get(&self) -> Result<Option<Lease>> {
        let resp = self
            .http
            .get(self.lease_url())
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", self.describe()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.json().await?)),
            status => bail!("Fetching {} failed: {}", self.describe(), status),
        }
    }

    /// POST or PUT `lease`. A conflict means another replica wrote first.
    async fn write(&self, lease: &Lease, create: bool) -> Result<bool> {
        let request = if create {
            self.http.post(self.collection_url())
        } else {
            self.http.put(self.lease_url())
        };
        let resp = request
            .bearer_auth(&self.token)
            .json(lease)
            .send()
            .await
            .with_context(|| format!("Failed to write {}", self.describe()))?;
        match resp.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            status => {
                let text = resp.text().await.unwrap_or_default();
                bail!("Writing {} failed: {} {}", self.describe(), status, text)
            }
        }
    }
}

#[async_trait]
impl LeaseLock for KubernetesLeaseLock {
    async fn try_acquire_or_renew(&self, holder: &str, lease_duration: Duration) -> Result<bool> {
        let wall = OffsetDateTime::now_utc();
        let Some(mut lease) = self.get().await? else {
            let lease = Lease {
                api_version: "coordination.k8s.io/v1".to_string(),
                kind: "Lease".to_string(),
                metadata: ObjectMeta {
                    name: self.name.clone(),
                    namespace: Some(self.namespace.clone()),
                    resource_version: None,
                },
                spec: claim(&LeaseSpec::default(), holder, lease_duration, wall)?,
            };
            let written = self.write(&lease, true).await?;
            if written {
                self.observe(&lease.spec, Instant::now());
            }
            return Ok(written);
        };
        let now = Instant::now();
        let observed_at = self.observe(&lease.spec, now);
        if !may_take(&lease.spec, holder, lease_duration, observed_at, now) {
            return Ok(false);
        }
        let previous = lease.spec.holder_identity.clone().unwrap_or_default();
        if !previous.is_empty() && previous != holder {
            tracing::info!("Taking over expired {} from {}", self.describe(), previous);
        }
        lease.spec = claim(&lease.spec, holder, lease_duration, wall)?;
        let written = self.write(&lease, false).await?;
        if written {
            self.observe(&lease.spec, Instant::now());
        }
        Ok(written)
    }

    async fn release(&self, holder: &str) -> Result<()> {
        let Some(mut lease) = self.get().await? else {
            return Ok(());
        };
        if lease.spec.holder_identity.as_deref() != Some(holder) {
            return Ok(());
        }
        lease.spec.holder_identity = None;
        lease.spec.lease_duration_seconds = Some(1);
        lease.spec.renew_time = Some(micro_time(OffsetDateTime::now_utc())?);
        if !self.write(&lease, false).await? {
            tracing::warn!("{} changed while releasing it", self.describe());
        }
        Ok(())
    }

    fn describe(&self) -> String { format!("lease {}/{}", self.namespace, self.name) }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn spec(holder: &str, renewed: &str, secs: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(secs),
            acquire_time: Some(renewed.to_string()),
            renew_time: Some(renewed.to_string()),
            lease_transitions: Some(3),
        }
    }

    #[test]
    fn test_may_take() {
        let seen = Instant::now();
        let no_duration = LeaseSpec { lease_duration_seconds: None, ..spec("b", "", 0) };
        let cases: &[(LeaseSpec, u64, bool)] = &[
            (LeaseSpec::default(), 0, true),
            (spec("", "2026-10-18T12:00:30.000000Z", 60), 0, true),
            (spec("a", "2026-10-18T12:00:30.000000Z", 60), 0, true),
            (spec("b", "2026-10-18T12:00:30.000000Z", 60), 59, false),
            (spec("b", "2026-10-18T12:00:30.000000Z", 60), 60, true),
            // A renewTime far in the past says nothing about this replica's clock.
            (spec("b", "2001-01-01T00:00:00.000000Z", 60), 30, false),
            (spec("b", "garbage", 60), 59, false),
            (spec("b", "garbage", 60), 61, true),
            (no_duration.clone(), 29, false),
            (no_duration, 30, true),
        ];
        for (spec, elapsed, expected) in cases {
            let now = seen + Duration::from_secs(*elapsed);
            let actual = may_take(spec, "a", Duration::from_secs(30), seen, now);
            assert_eq!(actual, *expected, "{spec:?} after {elapsed}s");
        }
    }

    #[test]
    fn test_observe_restarts_on_renewal() {
        let start = Instant::now();
        let held = spec("b", "2026-10-18T12:00:30.000000Z", 60);
        let mut slot = None;
        assert_eq!(observe(&mut slot, &held, start), start);
        let later = start + Duration::from_secs(45);
        assert_eq!(observe(&mut slot, &held, later), start);
        assert!(!may_take(&held, "a", Duration::from_secs(60), start, later));

        let renewed = spec("b", "2026-10-18T12:01:15.000000Z", 60);
        assert_eq!(observe(&mut slot, &renewed, later), later);
        let expired = start + Duration::from_secs(100);
        assert!(!may_take(&renewed, "a", Duration::from_secs(60), later, expired));
        let expired = later + Duration::from_secs(60);
        assert!(may_take(&renewed, "a", Duration::from_secs(60), later, expired));
    }

    #[test]
    fn test_claim() {
        let now = datetime!(2026-10-18 12:01:00.5 UTC);
        let held = spec("a", "2026-10-18T12:00:30.000000Z", 60);

        let renewed = claim(&held, "a", Duration::from_secs(60), now).unwrap();
        assert_eq!(renewed.renew_time.as_deref(), Some("2026-10-18T12:01:00.500000Z"));
        assert_eq!(renewed.acquire_time, held.acquire_time);
        assert_eq!(renewed.lease_transitions, Some(3));

        let taken = claim(&held, "b", Duration::from_secs(60), now).unwrap();
        assert_eq!(taken.holder_identity.as_deref(), Some("b"));
        assert_eq!(taken.acquire_time.as_deref(), Some("2026-10-18T12:01:00.500000Z"));
        assert_eq!(taken.lease_transitions, Some(4));

        let created = claim(&LeaseSpec::default(), "a", Duration::from_secs(60), now).unwrap();
        assert_eq!(created.lease_transitions, Some(0));
        assert_eq!(created.lease_duration_seconds, Some(60));
    }

    #[test]
    fn test_lease_wire_format() {
        let lease: Lease = serde_json::from_str(
            r#"{
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": {"name": "benchbot-lock", "namespace": "kube-system", "resourceVersion": "123", "uid": "x"},
                "spec": {"holderIdentity": "a", "leaseDurationSeconds": 60, "renewTime": "2026-10-18T12:00:30.000000Z"}
            }"#,
        )
        .unwrap();
        assert_eq!(lease.metadata.resource_version.as_deref(), Some("123"));
        assert_eq!(lease.spec.holder_identity.as_deref(), Some("a"));
        let value = serde_json::to_value(&lease).unwrap();
        assert_eq!(value["metadata"]["resourceVersion"], "123");
        assert_eq!(value["spec"]["leaseDurationSeconds"], 60);
        assert!(value["spec"].get("acquireTime").is_none());
    }
}
