//! Dry-run decorator: reads pass through to the wrapped gateway, every
//! mutation is simulated and logged with a `[DRY-RUN]` marker.
//!
//! Simulated PR and issue numbers live above [`SIMULATED_NUMBER_BASE`] so
//! they can never collide with real ones, and a resumed dry-run worker can
//! still recognise its own simulated PR without any in-memory state.

use super::{
    CiStatus, HostGateway, HostResult, Issue, Mergeability, MergeOutcome, NewIssue,
    NewPullRequest, PullRequest, ReviewComment, ReviewDecision,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const SIMULATED_NUMBER_BASE: u64 = 1 << 40;

const SIMULATED_MERGE_PREFIX: &str = "dry-run-merge-";

pub fn is_simulated(number: u64) -> bool {
    number >= SIMULATED_NUMBER_BASE
}

pub struct DryRunGateway {
    inner: Arc<dyn HostGateway>,
    issue_counter: AtomicU64,
}

impl DryRunGateway {
    pub fn new(inner: Arc<dyn HostGateway>) -> Self {
        Self {
            inner,
            issue_counter: AtomicU64::new(0),
        }
    }

    /// Simulated PR number for a branch's issue, stable across restarts.
    fn simulated_pr_number(head: &str) -> u64 {
        let issue = head
            .rsplit('-')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        SIMULATED_NUMBER_BASE + issue
    }
}

#[async_trait]
impl HostGateway for DryRunGateway {
    fn repo(&self) -> &str {
        self.inner.repo()
    }

    async fn get_issue(&self, number: u64) -> HostResult<Issue> {
        self.inner.get_issue(number).await
    }

    async fn list_open_issues(&self, labels: &[String]) -> HostResult<Vec<Issue>> {
        self.inner.list_open_issues(labels).await
    }

    async fn default_branch(&self) -> HostResult<String> {
        self.inner.default_branch().await
    }

    async fn find_pr(&self, head_branch: &str) -> HostResult<Option<PullRequest>> {
        self.inner.find_pr(head_branch).await
    }

    async fn find_or_create_pr(&self, pr: &NewPullRequest) -> HostResult<PullRequest> {
        if let Some(existing) = self.inner.find_pr(&pr.head).await? {
            return Ok(existing);
        }
        let number = Self::simulated_pr_number(&pr.head);
        tracing::info!(
            repo = self.repo(),
            head = %pr.head,
            base = %pr.base,
            title = %pr.title,
            "[DRY-RUN] would open pull request"
        );
        Ok(PullRequest {
            number,
            head_branch: pr.head.clone(),
            url: None,
            merged: false,
            merge_commit: None,
        })
    }

    async fn get_pr(&self, number: u64) -> HostResult<PullRequest> {
        if is_simulated(number) {
            return Ok(PullRequest {
                number,
                head_branch: format!(
                    "{}{}",
                    crate::engine::worker::BRANCH_PREFIX,
                    number - SIMULATED_NUMBER_BASE
                ),
                url: None,
                merged: false,
                merge_commit: None,
            });
        }
        self.inner.get_pr(number).await
    }

    async fn list_review_comments(
        &self,
        pr: u64,
        since: Option<DateTime<Utc>>,
    ) -> HostResult<Vec<ReviewComment>> {
        if is_simulated(pr) {
            return Ok(Vec::new());
        }
        self.inner.list_review_comments(pr, since).await
    }

    async fn review_decision(&self, pr: u64) -> HostResult<ReviewDecision> {
        if is_simulated(pr) {
            return Ok(ReviewDecision::Pending);
        }
        self.inner.review_decision(pr).await
    }

    async fn ci_status(&self, pr: u64) -> HostResult<CiStatus> {
        if is_simulated(pr) {
            return Ok(CiStatus::Absent);
        }
        self.inner.ci_status(pr).await
    }

    async fn failing_check_logs(&self, pr: u64) -> HostResult<String> {
        if is_simulated(pr) {
            return Ok(String::new());
        }
        self.inner.failing_check_logs(pr).await
    }

    async fn mergeability(&self, pr: u64) -> HostResult<Mergeability> {
        if is_simulated(pr) {
            return Ok(Mergeability::Clean);
        }
        self.inner.mergeability(pr).await
    }

    async fn merge_squash(&self, pr: u64, title: &str) -> HostResult<MergeOutcome> {
        tracing::info!(repo = self.repo(), pr, %title, "[DRY-RUN] would squash-merge pull request");
        Ok(MergeOutcome {
            sha: format!("{SIMULATED_MERGE_PREFIX}{pr}"),
        })
    }

    async fn main_build_status(&self, git_ref: &str) -> HostResult<CiStatus> {
        if git_ref.starts_with(SIMULATED_MERGE_PREFIX) {
            return Ok(CiStatus::Absent);
        }
        self.inner.main_build_status(git_ref).await
    }

    async fn create_issue(&self, issue: &NewIssue) -> HostResult<u64> {
        let n = self.issue_counter.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            repo = self.repo(),
            title = %issue.title,
            labels = ?issue.labels,
            "[DRY-RUN] would create issue"
        );
        Ok(SIMULATED_NUMBER_BASE + n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_pr_numbers_are_stable_and_out_of_range() {
        let a = DryRunGateway::simulated_pr_number("worker/issue-42");
        let b = DryRunGateway::simulated_pr_number("worker/issue-42");
        assert_eq!(a, b);
        assert!(is_simulated(a));
        assert_eq!(a - SIMULATED_NUMBER_BASE, 42);
        assert!(!is_simulated(42));
    }
}
