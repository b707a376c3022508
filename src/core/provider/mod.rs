mod github;
#[cfg(test)]
pub(crate) mod mock;
mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use github::{GitHubProvider, GitHubProviderOptions};
pub use retry::{RetryPolicy, RetryingProvider};

pub type RunId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
        }
    }

    /// GitHub reports several pre-start states (`waiting`, `requested`, `pending`);
    /// they all mean the run has not started executing yet.
    pub fn from_status(value: &str) -> Self {
        match value {
            "in_progress" => RunStatus::InProgress,
            "completed" => RunStatus::Completed,
            _ => RunStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
}

impl RunConclusion {
    pub fn as_str(self) -> &'static str {
        match self {
            RunConclusion::Success => "success",
            RunConclusion::Failure => "failure",
            RunConclusion::Cancelled => "cancelled",
        }
    }

    /// Anything that is neither a success nor a cancellation (`timed_out`,
    /// `startup_failure`, ...) is folded into `Failure`.
    pub fn from_conclusion(value: &str) -> Self {
        match value {
            "success" => RunConclusion::Success,
            "cancelled" => RunConclusion::Cancelled,
            _ => RunConclusion::Failure,
        }
    }
}

/// One dispatched execution of the workflow, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub number: u64,
    pub status: RunStatus,
    pub conclusion: Option<RunConclusion>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn is_terminal(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn conclusion_label(&self) -> &'static str {
        self.conclusion.map(RunConclusion::as_str).unwrap_or("unknown")
    }
}

/// A repository owned by the account behind a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub full_name: String,
    pub private: bool,
    pub description: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The account a token authenticates as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub login: String,
}

/// Credentials and repository every run-scoped call is made against.
#[derive(Clone, Copy)]
pub struct RunTarget<'a> {
    pub token: &'a str,
    pub repo: &'a str,
}

impl fmt::Debug for RunTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunTarget")
            .field("token", &"<redacted>")
            .field("repo", &self.repo)
            .finish()
    }
}

pub type DispatchInputs = BTreeMap<String, String>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("run {0} is already terminal")]
    AlreadyTerminal(RunId),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("dispatch accepted but the new run could not be located")]
    RunNotVisible,
}

impl ProviderError {
    /// Transient errors are retried by [`RetryPolicy`] and counted toward the
    /// degraded threshold by the reconciler.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Network(_)
        )
    }
}

/// Abstract capability set of a CI-style workflow provider.
#[async_trait]
pub trait WorkflowProvider: Send + Sync {
    /// Resolve the identity behind `token`; an unauthorized token yields `Auth`.
    async fn validate_token(&self, token: &str) -> Result<Identity, ProviderError>;

    async fn dispatch_run(
        &self,
        target: &RunTarget<'_>,
        workflow_id: &str,
        inputs: &DispatchInputs,
    ) -> Result<RunId, ProviderError>;

    /// Most recent runs of `workflow_id`, newest first.
    async fn list_runs(
        &self,
        target: &RunTarget<'_>,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, ProviderError>;

    async fn get_run(&self, target: &RunTarget<'_>, run_id: RunId)
    -> Result<WorkflowRun, ProviderError>;

    async fn cancel_run(&self, target: &RunTarget<'_>, run_id: RunId) -> Result<(), ProviderError>;

    /// Raw log text of a run. While the run is non-terminal the text only ever grows.
    async fn get_run_log(&self, target: &RunTarget<'_>, run_id: RunId)
    -> Result<String, ProviderError>;

    /// Repositories owned by the account behind `token`, most recently updated first.
    async fn list_repositories(
        &self,
        token: &str,
        limit: usize,
    ) -> Result<Vec<RepositorySummary>, ProviderError>;

    /// Create a public repository with an initial commit. Returns its `owner/name`.
    /// A name that is already taken yields `Rejected`.
    async fn create_repository(
        &self,
        token: &str,
        name: &str,
        description: &str,
    ) -> Result<String, ProviderError>;

    /// Create or replace the file at `path` in `target.repo`.
    async fn push_file(
        &self,
        target: &RunTarget<'_>,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<(), ProviderError>;
}
