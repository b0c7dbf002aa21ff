use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_FAILURE: &str = "FAILURE";
pub const STATUS_PENDING: &str = "pending";

/// Leading component of report records.
pub const REPORT_PREFIX: &str = "report";

/// Repository dispatch event types the CI system understands.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DispatchKind {
    BuildDocker,
    RunPerf,
    RerunPerf,
    RerunPerfAll,
}

impl DispatchKind {
    pub const fn variants() -> &'static [Self] {
        &[Self::BuildDocker, Self::RunPerf, Self::RerunPerf, Self::RerunPerfAll]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildDocker => "build-docker",
            Self::RunPerf => "run-perf",
            Self::RerunPerf => "rerun-perf",
            Self::RerunPerfAll => "rerun-perf-all",
        }
    }

    /// Benchmark completions also carry a report body.
    pub fn is_benchmark(&self) -> bool { !matches!(self, Self::BuildDocker) }
}

impl FromStr for DispatchKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::variants().iter().copied().find(|k| k.as_str() == s).ok_or(())
    }
}

impl fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// The commenter's role relative to the repository, as reported by GitHub.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum AuthorAssociation {
    Collaborator,
    Contributor,
    FirstTimer,
    FirstTimeContributor,
    Mannequin,
    Member,
    None,
    Owner,
    Other(String),
}

impl AuthorAssociation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Collaborator => "COLLABORATOR",
            Self::Contributor => "CONTRIBUTOR",
            Self::FirstTimer => "FIRST_TIMER",
            Self::FirstTimeContributor => "FIRST_TIME_CONTRIBUTOR",
            Self::Mannequin => "MANNEQUIN",
            Self::Member => "MEMBER",
            Self::None => "NONE",
            Self::Owner => "OWNER",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for AuthorAssociation {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "COLLABORATOR" => Self::Collaborator,
            "CONTRIBUTOR" => Self::Contributor,
            "FIRST_TIMER" => Self::FirstTimer,
            "FIRST_TIME_CONTRIBUTOR" => Self::FirstTimeContributor,
            "MANNEQUIN" => Self::Mannequin,
            "MEMBER" => Self::Member,
            "NONE" => Self::None,
            "OWNER" => Self::Owner,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for AuthorAssociation {
    fn from(value: &str) -> Self { Self::from(value.to_string()) }
}

impl From<AuthorAssociation> for String {
    fn from(value: AuthorAssociation) -> Self { value.as_str().to_string() }
}

impl fmt::Display for AuthorAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KeyError {
    #[error("store key must have at least one component")]
    Empty,
    #[error("store key component {index} is empty")]
    EmptyComponent { index: usize },
    #[error("store key component {component:?} contains '/'")]
    Separator { component: String },
}

/// A `/`-joined path into the metadata store.
///
/// Components are never empty and never contain `/`, so two distinct component
/// lists can never render to the same key.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StoreKey(Vec<String>);

impl StoreKey {
    pub fn new<I, S>(components: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components = components.into_iter().map(Into::into).collect::<Vec<String>>();
        if components.is_empty() {
            return Err(KeyError::Empty);
        }
        for (index, component) in components.iter().enumerate() {
            if component.is_empty() {
                return Err(KeyError::EmptyComponent { index });
            }
            if component.contains('/') {
                return Err(KeyError::Separator { component: component.clone() });
            }
        }
        Ok(Self(components))
    }

    /// `{dispatch_name}/{owner}/{repo}/{pr}/{commit}/{uuid}`
    pub fn status(
        kind: DispatchKind,
        owner: &str,
        repo: &str,
        pr: &str,
        commit: &str,
        uuid: &str,
    ) -> Result<Self, KeyError> {
        Self::new([kind.as_str(), owner, repo, pr, commit, uuid])
    }

    /// `report/{start_time}/{owner}/{repo}/{pr}/{commit}/{uuid}`
    pub fn report(
        start_time: &str,
        owner: &str,
        repo: &str,
        pr: &str,
        commit: &str,
        uuid: &str,
    ) -> Result<Self, KeyError> {
        Self::new([REPORT_PREFIX, start_time, owner, repo, pr, commit, uuid])
    }

    pub fn to_path(&self) -> String { self.0.join("/") }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_path()) }
}

/// Completion callback body posted by the CI workflows.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct StatusUpdate {
    pub org: Option<String>,
    pub repo: Option<String>,
    pub pr: Option<String>,
    #[serde(rename = "commitSHA")]
    pub commit_sha: Option<String>,
    pub run_id: Option<String>,
    pub author: Option<String>,
    pub uuid: Option<String>,
    pub dispatch_name: Option<String>,
    pub current: Option<String>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub compare: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    #[serde(rename = "PRLink")]
    pub pr_link: Option<String>,
    #[serde(rename = "currentLog")]
    pub current_log: Option<String>,
    #[serde(rename = "refLog")]
    pub ref_log: Option<String>,
    pub start_time: Option<String>,
}
