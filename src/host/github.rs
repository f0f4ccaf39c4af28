//! [`HostGateway`] over the GitHub REST API.

use super::{
    CiStatus, HostError, HostGateway, HostResult, Issue, Mergeability, MergeOutcome, NewIssue,
    NewPullRequest, PullRequest, ReviewComment, ReviewDecision,
};
use crate::github::http::GhHttp;
use crate::github::types::{
    CheckRunsPage, CombinedStatus, GitHubIssue, GitHubPull, GitHubReview,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use tokio::sync::OnceCell;

/// Stand-in body for a changes-requested review submitted without text.
const NO_SUMMARY_CHANGES_REQUESTED: &str =
    "Changes requested without a summary; see the inline comments on this review.";

/// Longest slice of a check's output passed on to the oracle.
const MAX_CHECK_OUTPUT_CHARS: usize = 4000;

static CLOSING_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s+#(\d+)\b").expect("static regex")
});

static WORKER_BRANCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^worker/issue-(\d+)$").expect("static regex"));

pub struct GitHubGateway {
    http: GhHttp,
    repo: String,
    default_branch: OnceCell<String>,
}

impl GitHubGateway {
    pub fn new(http: GhHttp, repo: impl Into<String>) -> Self {
        Self {
            http,
            repo: repo.into(),
            default_branch: OnceCell::new(),
        }
    }

    async fn head_sha(&self, pr: u64) -> HostResult<String> {
        Ok(self.http.get_pull(&self.repo, pr).await?.head.sha)
    }

    async fn ref_status(&self, git_ref: &str) -> HostResult<CiStatus> {
        let (runs, status) = tokio::join!(
            self.http.get_check_runs(&self.repo, git_ref),
            self.http.get_commit_status(&self.repo, git_ref)
        );
        let runs = runs?;
        // legacy statuses are optional; a 404 just means none
        let status = match status {
            Ok(s) => Some(s),
            Err(HostError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(reduce_checks(&runs, status.as_ref()))
    }
}

#[async_trait]
impl HostGateway for GitHubGateway {
    fn repo(&self) -> &str {
        &self.repo
    }

    async fn get_issue(&self, number: u64) -> HostResult<Issue> {
        let issue = self.http.get_issue(&self.repo, number).await?;
        if issue.pull_request.is_some() {
            return Err(HostError::NotFound(format!("#{number} is a pull request")));
        }
        let pr = self
            .http
            .find_open_pull(&self.repo, &crate::engine::worker::branch_name(number))
            .await?;
        let mut issue = to_issue(issue);
        issue.linked_pr = pr.map(|p| p.number);
        Ok(issue)
    }

    async fn list_open_issues(&self, labels: &[String]) -> HostResult<Vec<Issue>> {
        // the issues API ANDs labels, so fetch per label and union
        let mut seen = HashSet::new();
        let mut issues = Vec::new();
        if labels.is_empty() {
            issues = self.http.list_open_issues(&self.repo, None).await?;
        } else {
            for label in labels {
                for issue in self.http.list_open_issues(&self.repo, Some(label)).await? {
                    if seen.insert(issue.number) {
                        issues.push(issue);
                    }
                }
            }
        }

        let pulls = self.http.list_open_pulls(&self.repo).await?;
        let links = linked_prs(&pulls);
        let mut out: Vec<Issue> = issues
            .into_iter()
            .map(|i| {
                let mut issue = to_issue(i);
                issue.linked_pr = links.get(&issue.number).copied();
                issue
            })
            .collect();
        out.sort_by_key(|i| i.number);
        Ok(out)
    }

    async fn default_branch(&self) -> HostResult<String> {
        self.default_branch
            .get_or_try_init(|| self.http.default_branch(&self.repo))
            .await
            .cloned()
    }

    async fn find_pr(&self, head_branch: &str) -> HostResult<Option<PullRequest>> {
        Ok(self
            .http
            .find_open_pull(&self.repo, head_branch)
            .await?
            .map(to_pull_request))
    }

    async fn find_or_create_pr(&self, pr: &NewPullRequest) -> HostResult<PullRequest> {
        if let Some(existing) = self.find_pr(&pr.head).await? {
            tracing::info!(pr = existing.number, branch = %pr.head, "reusing open PR");
            return Ok(existing);
        }
        match self
            .http
            .create_pull(&self.repo, &pr.head, &pr.base, &pr.title, &pr.body)
            .await
        {
            Ok(created) => {
                tracing::info!(pr = created.number, branch = %pr.head, "opened PR");
                Ok(to_pull_request(created))
            }
            // raced with another create for the same head
            Err(HostError::Other(e)) if e.to_string().contains("already exists") => self
                .find_pr(&pr.head)
                .await?
                .ok_or_else(|| HostError::Other(e)),
            Err(e) => Err(e),
        }
    }

    async fn get_pr(&self, number: u64) -> HostResult<PullRequest> {
        Ok(to_pull_request(self.http.get_pull(&self.repo, number).await?))
    }

    async fn list_review_comments(
        &self,
        pr: u64,
        since: Option<DateTime<Utc>>,
    ) -> HostResult<Vec<ReviewComment>> {
        let since_str = since.map(|s| s.to_rfc3339());
        let (reviews, comments) = tokio::join!(
            self.http.get_pr_reviews(&self.repo, pr),
            self.http.get_pr_comments(&self.repo, pr, since_str.as_deref())
        );
        let reviews = reviews?;
        let comments = comments?;

        let review_state: HashMap<u64, bool> = reviews
            .iter()
            .map(|r| (r.id, r.requests_changes()))
            .collect();

        let mut out: Vec<ReviewComment> = comments
            .into_iter()
            .map(|c| ReviewComment {
                id: c.id,
                author: c.user.map(|u| u.login).unwrap_or_default(),
                changes_requested: c
                    .pull_request_review_id
                    .and_then(|id| review_state.get(&id).copied())
                    .unwrap_or(false),
                body: c.body,
                path: c.path,
                line: c.line,
                in_reply_to: c.in_reply_to_id,
                created_at: parse_time(&c.created_at),
            })
            .collect();

        out.extend(reviews.iter().filter_map(review_summary));
        out.retain(|c| match (since, c.created_at) {
            (Some(since), Some(at)) => at > since,
            _ => true,
        });
        out.sort_by_key(|c| (c.created_at, c.id));
        Ok(out)
    }

    async fn review_decision(&self, pr: u64) -> HostResult<ReviewDecision> {
        let reviews = self.http.get_pr_reviews(&self.repo, pr).await?;
        Ok(decision_from_reviews(&reviews))
    }

    async fn ci_status(&self, pr: u64) -> HostResult<CiStatus> {
        let sha = self.head_sha(pr).await?;
        self.ref_status(&sha).await
    }

    async fn failing_check_logs(&self, pr: u64) -> HostResult<String> {
        let sha = self.head_sha(pr).await?;
        let runs = self.http.get_check_runs(&self.repo, &sha).await?;
        let mut out = String::new();
        for run in runs
            .check_runs
            .iter()
            .filter(|r| r.is_complete() && !r.is_passing())
        {
            out.push_str(&format!(
                "## {} ({})\n",
                run.name,
                run.conclusion.as_deref().unwrap_or("unknown")
            ));
            if let Some(url) = &run.html_url {
                out.push_str(&format!("{url}\n"));
            }
            if let Some(output) = &run.output {
                for part in [&output.title, &output.summary, &output.text]
                    .into_iter()
                    .flatten()
                {
                    let clipped: String = part.chars().take(MAX_CHECK_OUTPUT_CHARS).collect();
                    out.push_str(&clipped);
                    out.push('\n');
                }
            }
            out.push('\n');
        }
        Ok(out)
    }

    async fn mergeability(&self, pr: u64) -> HostResult<Mergeability> {
        let pull = self.http.get_pull(&self.repo, pr).await?;
        Ok(match (pull.mergeable, pull.mergeable_state.as_deref()) {
            (Some(false), _) | (_, Some("dirty")) => Mergeability::Conflicting,
            (None, _) => Mergeability::Unknown,
            (Some(true), _) => Mergeability::Clean,
        })
    }

    async fn merge_squash(&self, pr: u64, title: &str) -> HostResult<MergeOutcome> {
        let resp = self.http.merge_pull(&self.repo, pr, title).await?;
        if !resp.merged {
            return Err(HostError::Conflict(
                resp.message.unwrap_or_else(|| format!("PR #{pr} was not merged")),
            ));
        }
        let sha = resp
            .sha
            .ok_or_else(|| HostError::Other(anyhow::anyhow!("merge response without sha")))?;
        tracing::info!(pr, %sha, "squash-merged PR");
        Ok(MergeOutcome { sha })
    }

    async fn main_build_status(&self, git_ref: &str) -> HostResult<CiStatus> {
        self.ref_status(git_ref).await
    }

    async fn create_issue(&self, issue: &NewIssue) -> HostResult<u64> {
        let created = self
            .http
            .create_issue(&self.repo, &issue.title, &issue.body, &issue.labels)
            .await?;
        tracing::info!(issue = created.number, title = %issue.title, "created issue");
        Ok(created.number)
    }
}

fn to_issue(issue: GitHubIssue) -> Issue {
    Issue {
        labels: issue.label_names(),
        number: issue.number,
        title: issue.title,
        body: issue.body.unwrap_or_default(),
        linked_pr: None,
        url: issue.html_url,
    }
}

fn to_pull_request(pull: GitHubPull) -> PullRequest {
    PullRequest {
        number: pull.number,
        head_branch: pull.head.ref_name,
        url: Some(pull.html_url),
        merged: pull.merged_at.is_some(),
        merge_commit: pull.merge_commit_sha,
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A review's top-level body, surfaced as a comment without a path.
/// Review bodies as comments. A changes-requested review with no body
/// still comes through, so the request cannot be missed.
fn review_summary(review: &GitHubReview) -> Option<ReviewComment> {
    let body = review.body.as_deref().unwrap_or("").trim();
    let body = match (body.is_empty(), review.requests_changes()) {
        (true, true) => NO_SUMMARY_CHANGES_REQUESTED,
        (true, false) => return None,
        (false, requests_changes) if requests_changes || review.state == "COMMENTED" => body,
        _ => return None,
    };
    Some(ReviewComment {
        id: review.id,
        author: review
            .user
            .as_ref()
            .map(|u| u.login.clone())
            .unwrap_or_default(),
        body: body.to_string(),
        path: None,
        line: None,
        changes_requested: review.requests_changes(),
        in_reply_to: None,
        created_at: review.submitted_at.as_deref().and_then(parse_time),
    })
}

/// Issue number → open PR, by worker branch name or closing keyword.
fn linked_prs(pulls: &[GitHubPull]) -> HashMap<u64, u64> {
    let mut links = HashMap::new();
    for pull in pulls {
        if let Some(n) = WORKER_BRANCH
            .captures(&pull.head.ref_name)
            .and_then(|c| c[1].parse::<u64>().ok())
        {
            links.entry(n).or_insert(pull.number);
        }
        let text = format!("{}\n{}", pull.title, pull.body.as_deref().unwrap_or(""));
        for cap in CLOSING_KEYWORD.captures_iter(&text) {
            if let Ok(n) = cap[1].parse::<u64>() {
                links.entry(n).or_insert(pull.number);
            }
        }
    }
    links
}

/// Latest decisive review per reviewer.
fn decision_from_reviews(reviews: &[GitHubReview]) -> ReviewDecision {
    let mut latest: HashMap<&str, &str> = HashMap::new();
    for review in reviews {
        let state = review.state.as_str();
        if !matches!(state, "APPROVED" | "CHANGES_REQUESTED" | "DISMISSED") {
            continue;
        }
        let who = review.user.as_ref().map(|u| u.login.as_str()).unwrap_or("");
        latest.insert(who, state);
    }
    if latest.values().any(|s| *s == "CHANGES_REQUESTED") {
        ReviewDecision::ChangesRequested
    } else if latest.values().any(|s| *s == "APPROVED") {
        ReviewDecision::Approved
    } else {
        ReviewDecision::Pending
    }
}

/// Fold check runs and legacy commit statuses into one [`CiStatus`].
fn reduce_checks(runs: &CheckRunsPage, status: Option<&CombinedStatus>) -> CiStatus {
    let status = status.filter(|s| s.total_count > 0);
    if runs.check_runs.is_empty() && status.is_none() {
        return CiStatus::Absent;
    }
    let run_failed = runs
        .check_runs
        .iter()
        .any(|r| r.is_complete() && !r.is_passing());
    let status_failed = status.is_some_and(|s| matches!(s.state.as_str(), "failure" | "error"));
    if run_failed || status_failed {
        return CiStatus::Failure;
    }
    let run_pending = runs.check_runs.iter().any(|r| !r.is_complete());
    let status_pending = status.is_some_and(|s| s.state == "pending");
    if run_pending || status_pending {
        CiStatus::Pending
    } else {
        CiStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::types::{CheckRun, GitHubRef, GitHubUser};

    fn run(status: &str, conclusion: Option<&str>) -> CheckRun {
        CheckRun {
            id: 1,
            name: "ci".into(),
            status: status.into(),
            conclusion: conclusion.map(String::from),
            html_url: None,
            output: None,
        }
    }

    fn page(runs: Vec<CheckRun>) -> CheckRunsPage {
        CheckRunsPage {
            total_count: runs.len() as u64,
            check_runs: runs,
        }
    }

    #[test]
    fn no_checks_is_absent() {
        assert_eq!(reduce_checks(&page(vec![]), None), CiStatus::Absent);
        let empty = CombinedStatus {
            state: "pending".into(),
            total_count: 0,
        };
        assert_eq!(reduce_checks(&page(vec![]), Some(&empty)), CiStatus::Absent);
    }

    #[test]
    fn failure_beats_pending() {
        let runs = page(vec![run("completed", Some("failure")), run("in_progress", None)]);
        assert_eq!(reduce_checks(&runs, None), CiStatus::Failure);
    }

    #[test]
    fn pending_until_all_complete() {
        let runs = page(vec![run("completed", Some("success")), run("queued", None)]);
        assert_eq!(reduce_checks(&runs, None), CiStatus::Pending);
        let runs = page(vec![run("completed", Some("success")), run("completed", Some("skipped"))]);
        assert_eq!(reduce_checks(&runs, None), CiStatus::Success);
    }

    #[test]
    fn legacy_status_counts() {
        let failing = CombinedStatus {
            state: "error".into(),
            total_count: 1,
        };
        assert_eq!(reduce_checks(&page(vec![]), Some(&failing)), CiStatus::Failure);
    }

    fn pull(number: u64, branch: &str, body: &str) -> GitHubPull {
        GitHubPull {
            number,
            title: "change".into(),
            body: Some(body.into()),
            state: "open".into(),
            html_url: format!("https://github.com/o/r/pull/{number}"),
            head: GitHubRef {
                ref_name: branch.into(),
                sha: "abc".into(),
            },
            merged_at: None,
            merge_commit_sha: None,
            mergeable: None,
            mergeable_state: None,
        }
    }

    #[test]
    fn links_by_branch_and_closing_keyword() {
        let pulls = vec![
            pull(100, "worker/issue-7", ""),
            pull(101, "feature/x", "This Fixes #12 and mentions #13"),
        ];
        let links = linked_prs(&pulls);
        assert_eq!(links.get(&7), Some(&100));
        assert_eq!(links.get(&12), Some(&101));
        assert_eq!(links.get(&13), None);
    }

    fn review(id: u64, who: &str, state: &str) -> GitHubReview {
        GitHubReview {
            id,
            user: Some(GitHubUser { login: who.into() }),
            body: None,
            state: state.into(),
            submitted_at: None,
        }
    }

    #[test]
    fn decision_uses_latest_review_per_user() {
        assert_eq!(
            decision_from_reviews(&[
                review(1, "a", "CHANGES_REQUESTED"),
                review(2, "a", "APPROVED"),
            ]),
            ReviewDecision::Approved
        );
        assert_eq!(
            decision_from_reviews(&[
                review(1, "a", "APPROVED"),
                review(2, "b", "CHANGES_REQUESTED"),
            ]),
            ReviewDecision::ChangesRequested
        );
        assert_eq!(
            decision_from_reviews(&[review(1, "a", "COMMENTED")]),
            ReviewDecision::Pending
        );
    }

    #[test]
    fn review_summaries_only_for_bodies() {
        assert!(review_summary(&review(4, "a", "COMMENTED")).is_none());
        assert!(review_summary(&review(6, "a", "APPROVED")).is_none());

        let mut r = review(5, "a", "CHANGES_REQUESTED");
        let bare = review_summary(&r).unwrap();
        assert!(bare.changes_requested);
        assert_eq!(bare.body, NO_SUMMARY_CHANGES_REQUESTED);

        r.body = Some("Must handle the empty case".into());
        let c = review_summary(&r).unwrap();
        assert!(c.changes_requested);
        assert!(c.path.is_none());
        r.state = "APPROVED".into();
        assert!(review_summary(&r).is_none());
    }
}
