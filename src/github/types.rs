//! GitHub REST response types. Only the fields the gateway reads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubIssue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<GitHubLabel>,
    pub html_url: Option<String>,
    /// Set when the "issue" is actually a pull request.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl GitHubIssue {
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubLabel {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubUser {
    pub login: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubPull {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub html_url: String,
    pub head: GitHubRef,
    #[serde(default)]
    pub merged_at: Option<String>,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,
    /// `None` while GitHub is still computing it.
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub mergeable_state: Option<String>,
}

/// PR review state: "APPROVED", "CHANGES_REQUESTED", "COMMENTED", "DISMISSED".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubReview {
    pub id: u64,
    pub user: Option<GitHubUser>,
    pub body: Option<String>,
    pub state: String,
    pub submitted_at: Option<String>,
}

impl GitHubReview {
    pub fn requests_changes(&self) -> bool {
        self.state == "CHANGES_REQUESTED"
    }

    pub fn is_approval(&self) -> bool {
        self.state == "APPROVED"
    }
}

/// PR review comment on a specific line of code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubReviewComment {
    pub id: u64,
    pub user: Option<GitHubUser>,
    pub body: String,
    pub path: Option<String>,
    pub line: Option<u32>,
    pub created_at: String,
    pub in_reply_to_id: Option<u64>,
    pub pull_request_review_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRunOutput {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub html_url: Option<String>,
    pub output: Option<CheckRunOutput>,
}

impl CheckRun {
    pub fn is_complete(&self) -> bool {
        self.status == "completed"
    }

    pub fn is_passing(&self) -> bool {
        matches!(
            self.conclusion.as_deref(),
            Some("success" | "neutral" | "skipped")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRunsPage {
    pub total_count: u64,
    #[serde(default)]
    pub check_runs: Vec<CheckRun>,
}

/// Legacy commit statuses (`/commits/{ref}/status`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedStatus {
    pub state: String,
    pub total_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResponse {
    pub sha: Option<String>,
    pub merged: bool,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_with_pull_request_marker() {
        let json = r#"{
            "number": 12,
            "title": "Add export",
            "body": null,
            "state": "open",
            "labels": [{"name": "bug", "color": "d73a4a"}],
            "html_url": "https://github.com/o/r/pull/12",
            "pull_request": {"url": "https://api.github.com/repos/o/r/pulls/12"}
        }"#;
        let issue: GitHubIssue = serde_json::from_str(json).unwrap();
        assert!(issue.pull_request.is_some());
        assert_eq!(issue.label_names(), vec!["bug"]);
    }

    #[test]
    fn review_comment_deserialization() {
        let json = r#"{
            "id": 101112,
            "user": {"login": "reviewer"},
            "body": "This line needs fixing",
            "path": "src/main.rs",
            "line": 42,
            "commit_id": "abc123",
            "created_at": "2024-01-01T12:00:00Z",
            "in_reply_to_id": null,
            "pull_request_review_id": 789
        }"#;
        let comment: GitHubReviewComment = serde_json::from_str(json).unwrap();
        assert_eq!(comment.id, 101112);
        assert_eq!(comment.path.as_deref(), Some("src/main.rs"));
        assert_eq!(comment.pull_request_review_id, Some(789));
        assert!(comment.in_reply_to_id.is_none());
    }

    #[test]
    fn review_states() {
        let review: GitHubReview = serde_json::from_str(
            r#"{"id": 1, "user": {"login": "r"}, "body": "", "state": "CHANGES_REQUESTED", "submitted_at": null}"#,
        )
        .unwrap();
        assert!(review.requests_changes());
        assert!(!review.is_approval());
    }

    #[test]
    fn check_run_conclusions() {
        let run: CheckRun = serde_json::from_str(
            r#"{"id": 3, "name": "test", "status": "completed", "conclusion": "skipped"}"#,
        )
        .unwrap();
        assert!(run.is_complete());
        assert!(run.is_passing());

        let run: CheckRun = serde_json::from_str(
            r#"{"id": 4, "name": "lint", "status": "in_progress", "conclusion": null}"#,
        )
        .unwrap();
        assert!(!run.is_complete());
        assert!(!run.is_passing());
    }
}
