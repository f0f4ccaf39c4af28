//! Host gateway: the narrow surface of the issue/PR host the worker and
//! manager depend on.
//!
//! The state machine branches on [`HostError::Conflict`] specifically
//! (BLOCKED rather than FAILED), so every implementation must surface
//! conflicts through that variant and never fold them into a generic error.

pub mod dry_run;
pub mod github;

pub use dry_run::DryRunGateway;
pub use github::GitHubGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transient host failure: {0}")]
    Transient(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<reqwest::Error> for HostError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::Transient(e.to_string())
        } else {
            Self::Other(e.into())
        }
    }
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        Self::Other(anyhow::Error::new(e).context("decoding GitHub response"))
    }
}

pub type HostResult<T> = Result<T, HostError>;

/// CI / check status reduced to what the state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiStatus {
    Pending,
    Success,
    Failure,
    /// No checks configured for the ref.
    Absent,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Absent => "absent",
        }
    }
}

impl std::fmt::Display for CiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mergeability {
    Clean,
    Conflicting,
    /// Host has not finished computing it yet.
    Unknown,
}

/// Reviewers' standing verdict on a PR, from each reviewer's latest
/// decisive review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Someone approved and nobody's latest review requests changes.
    Approved,
    ChangesRequested,
    /// No decisive review yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub linked_pr: Option<u64>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub head_branch: String,
    pub url: Option<String>,
    pub merged: bool,
    pub merge_commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewComment {
    pub id: u64,
    pub author: String,
    pub body: String,
    /// File the comment is anchored to; `None` for review summaries.
    pub path: Option<String>,
    pub line: Option<u32>,
    /// Part of a review that requested changes.
    pub changes_requested: bool,
    pub in_reply_to: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub sha: String,
}

#[async_trait]
pub trait HostGateway: Send + Sync {
    /// `owner/name` this gateway talks to.
    fn repo(&self) -> &str;

    async fn get_issue(&self, number: u64) -> HostResult<Issue>;

    /// Open issues (pull requests excluded) carrying any of `labels`, or all
    /// open issues when `labels` is empty. `linked_pr` is filled in.
    async fn list_open_issues(&self, labels: &[String]) -> HostResult<Vec<Issue>>;

    async fn default_branch(&self) -> HostResult<String>;

    async fn find_pr(&self, head_branch: &str) -> HostResult<Option<PullRequest>>;

    /// Return the open PR for `pr.head`, creating it if there is none.
    async fn find_or_create_pr(&self, pr: &NewPullRequest) -> HostResult<PullRequest>;

    async fn get_pr(&self, number: u64) -> HostResult<PullRequest>;

    /// Review comments (line comments and review summaries) created after
    /// `since`, oldest first.
    async fn list_review_comments(
        &self,
        pr: u64,
        since: Option<DateTime<Utc>>,
    ) -> HostResult<Vec<ReviewComment>>;

    async fn review_decision(&self, pr: u64) -> HostResult<ReviewDecision>;

    async fn ci_status(&self, pr: u64) -> HostResult<CiStatus>;

    /// Human-readable summary of failing checks on the PR head.
    async fn failing_check_logs(&self, pr: u64) -> HostResult<String>;

    async fn mergeability(&self, pr: u64) -> HostResult<Mergeability>;

    async fn merge_squash(&self, pr: u64, title: &str) -> HostResult<MergeOutcome>;

    /// Check status of a commit or branch on the default branch.
    async fn main_build_status(&self, git_ref: &str) -> HostResult<CiStatus>;

    /// Returns the new issue number.
    async fn create_issue(&self, issue: &NewIssue) -> HostResult<u64>;
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `attempts` runs out. Rate limits wait for the advertised delay.
pub async fn with_retries<T, F, Fut>(attempts: u32, base_delay: Duration, mut op: F) -> HostResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HostResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = match &e {
                    HostError::RateLimited { retry_after } => *retry_after,
                    _ => base_delay * 2u32.saturating_pow(attempt - 1),
                };
                tracing::warn!(attempt, attempts, delay_ms = delay.as_millis() as u64, err = %e, "retrying host call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
