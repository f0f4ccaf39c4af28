//! Native `reqwest` HTTP client for the GitHub REST API.
//!
//! Uses a shared `reqwest::Client` with connection pooling, reads
//! rate-limit headers proactively and backs off exponentially on
//! rate-limit responses. Errors come back as [`HostError`] so callers can
//! tell conflicts and rate limits apart from generic failures.

use super::backoff::{is_rate_limit_body, GhBackoff};
use super::types::{
    CheckRunsPage, CombinedStatus, GitHubIssue, GitHubPull, GitHubReview, GitHubReviewComment,
    MergeResponse,
};
use crate::host::{HostError, HostResult};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

pub const GITHUB_API: &str = "https://api.github.com";

/// Rate-limit state is shared by every client in the process: the quota is
/// per token, not per connection.
static RATE_LIMIT: LazyLock<Mutex<GhBackoff>> =
    LazyLock::new(|| Mutex::new(GhBackoff::from_config()));

#[derive(Clone)]
pub struct GhHttp {
    client: Client,
    token: String,
    base_url: String,
}

impl GhHttp {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("drover/", env!("CARGO_PKG_VERSION"), " (reqwest)"))
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            token: token.into(),
            base_url: GITHUB_API.to_string(),
        })
    }

    /// Point the client at a different API root (GitHub Enterprise).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    // ── Rate-limit helpers ──────────────────────────────────────

    /// Remaining pause if the API is currently rate-limited.
    pub fn is_rate_limited() -> Option<Duration> {
        RATE_LIMIT.lock().ok().and_then(|rl| rl.is_active())
    }

    fn check_backoff() -> HostResult<()> {
        match Self::is_rate_limited() {
            Some(retry_after) => Err(HostError::RateLimited { retry_after }),
            None => Ok(()),
        }
    }

    fn record_response(resp: &Response) {
        if let Ok(mut rl) = RATE_LIMIT.lock() {
            rl.update_from_headers(resp.headers());
            if resp.status().is_success() {
                rl.record_success();
            }
        }
    }

    fn record_rate_limit() -> Duration {
        RATE_LIMIT
            .lock()
            .map(|mut rl| rl.record_rate_limit())
            .unwrap_or(Duration::from_secs(super::backoff::DEFAULT_BASE_SECONDS))
    }

    // ── Low-level HTTP helpers ──────────────────────────────────

    async fn send(&self, what: &str, req: RequestBuilder) -> HostResult<Response> {
        Self::check_backoff()?;
        let resp = req
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?;
        Self::record_response(&resp);
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(what, status, &body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> HostResult<T> {
        let url = self.url(path);
        let resp = self
            .send(&format!("GET {path}"), self.client.get(&url).query(query))
            .await?;
        Ok(serde_json::from_str(&resp.text().await?)?)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
    ) -> HostResult<T> {
        let url = self.url(path);
        let what = format!("{method} {path}");
        let resp = self
            .send(&what, self.client.request(method, &url).json(body))
            .await?;
        Ok(serde_json::from_str(&resp.text().await?)?)
    }

    /// Paginated GET, follows `Link: <…>; rel="next"` headers.
    async fn get_all_pages<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> HostResult<Vec<T>> {
        let mut all: Vec<T> = Vec::new();
        let mut req = self.client.get(self.url(path)).query(query);
        loop {
            let resp = self.send(&format!("GET {path} (paginated)"), req).await?;
            let next_url = parse_link_next(resp.headers());
            let page: Vec<T> = serde_json::from_str(&resp.text().await?)?;
            all.extend(page);
            match next_url {
                Some(next) => req = self.client.get(next),
                None => break,
            }
        }
        Ok(all)
    }

    // ── Repository / issues ─────────────────────────────────────

    pub async fn default_branch(&self, repo: &str) -> HostResult<String> {
        let value: serde_json::Value = self.get_json(&format!("/repos/{repo}"), &[]).await?;
        Ok(value
            .get("default_branch")
            .and_then(|v| v.as_str())
            .unwrap_or("main")
            .to_string())
    }

    pub async fn get_issue(&self, repo: &str, number: u64) -> HostResult<GitHubIssue> {
        self.get_json(&format!("/repos/{repo}/issues/{number}"), &[])
            .await
    }

    /// Open issues, optionally filtered by one label. Pull requests are
    /// dropped (the issues endpoint returns both).
    pub async fn list_open_issues(
        &self,
        repo: &str,
        label: Option<&str>,
    ) -> HostResult<Vec<GitHubIssue>> {
        let mut query = vec![("state", "open"), ("per_page", "100")];
        if let Some(label) = label {
            query.push(("labels", label));
        }
        let all: Vec<GitHubIssue> = self
            .get_all_pages(&format!("/repos/{repo}/issues"), &query)
            .await?;
        Ok(all
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .collect())
    }

    pub async fn create_issue(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> HostResult<GitHubIssue> {
        let payload = serde_json::json!({
            "title": title,
            "body": body,
            "labels": labels,
        });
        self.send_json(reqwest::Method::POST, &format!("/repos/{repo}/issues"), &payload)
            .await
    }

    // ── Pull requests ───────────────────────────────────────────

    pub async fn list_open_pulls(&self, repo: &str) -> HostResult<Vec<GitHubPull>> {
        self.get_all_pages(
            &format!("/repos/{repo}/pulls"),
            &[("state", "open"), ("per_page", "100")],
        )
        .await
    }

    /// Open PR whose head is `branch` in the repo owner's namespace.
    pub async fn find_open_pull(&self, repo: &str, branch: &str) -> HostResult<Option<GitHubPull>> {
        let owner = repo
            .split('/')
            .next()
            .ok_or_else(|| HostError::Other(anyhow::anyhow!("invalid repo format: {repo}")))?;
        let head = format!("{owner}:{branch}");
        let prs: Vec<GitHubPull> = self
            .get_json(
                &format!("/repos/{repo}/pulls"),
                &[("head", &head), ("state", "open"), ("per_page", "1")],
            )
            .await?;
        Ok(prs.into_iter().next())
    }

    pub async fn create_pull(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> HostResult<GitHubPull> {
        let payload = serde_json::json!({
            "title": title,
            "head": head,
            "base": base,
            "body": body,
        });
        self.send_json(reqwest::Method::POST, &format!("/repos/{repo}/pulls"), &payload)
            .await
    }

    pub async fn get_pull(&self, repo: &str, number: u64) -> HostResult<GitHubPull> {
        self.get_json(&format!("/repos/{repo}/pulls/{number}"), &[])
            .await
    }

    pub async fn get_pr_reviews(&self, repo: &str, number: u64) -> HostResult<Vec<GitHubReview>> {
        self.get_all_pages(
            &format!("/repos/{repo}/pulls/{number}/reviews"),
            &[("per_page", "100")],
        )
        .await
    }

    /// Line comments on a PR, optionally only those updated after `since`
    /// (ISO 8601).
    pub async fn get_pr_comments(
        &self,
        repo: &str,
        number: u64,
        since: Option<&str>,
    ) -> HostResult<Vec<GitHubReviewComment>> {
        let mut query = vec![("per_page", "100"), ("sort", "created"), ("direction", "asc")];
        if let Some(since) = since {
            query.push(("since", since));
        }
        self.get_all_pages(&format!("/repos/{repo}/pulls/{number}/comments"), &query)
            .await
    }

    /// Squash-merge a PR. A 405/409 comes back as [`HostError::Conflict`].
    pub async fn merge_pull(
        &self,
        repo: &str,
        number: u64,
        title: &str,
    ) -> HostResult<MergeResponse> {
        let payload = serde_json::json!({
            "merge_method": "squash",
            "commit_title": title,
        });
        self.send_json(
            reqwest::Method::PUT,
            &format!("/repos/{repo}/pulls/{number}/merge"),
            &payload,
        )
        .await
    }

    // ── Checks ──────────────────────────────────────────────────

    /// Every check run on `git_ref`. The endpoint wraps runs in an object,
    /// so pages are merged here rather than through `get_all_pages`.
    pub async fn get_check_runs(&self, repo: &str, git_ref: &str) -> HostResult<CheckRunsPage> {
        let git_ref = urlencoding::encode(git_ref);
        let path = format!("/repos/{repo}/commits/{git_ref}/check-runs");
        let mut req = self.client.get(self.url(&path)).query(&[("per_page", "100")]);
        let mut merged: Option<CheckRunsPage> = None;
        loop {
            let resp = self.send(&format!("GET {path} (paginated)"), req).await?;
            let next_url = parse_link_next(resp.headers());
            let page: CheckRunsPage = serde_json::from_str(&resp.text().await?)?;
            match merged.as_mut() {
                Some(all) => all.check_runs.extend(page.check_runs),
                None => merged = Some(page),
            }
            match next_url {
                Some(next) => req = self.client.get(next),
                None => break,
            }
        }
        Ok(merged.unwrap_or(CheckRunsPage {
            total_count: 0,
            check_runs: Vec::new(),
        }))
    }

    pub async fn get_commit_status(&self, repo: &str, git_ref: &str) -> HostResult<CombinedStatus> {
        let git_ref = urlencoding::encode(git_ref);
        self.get_json(&format!("/repos/{repo}/commits/{git_ref}/status"), &[])
            .await
    }
}

/// Map a non-2xx response onto the error taxonomy.
fn classify_failure(what: &str, status: StatusCode, body: &str) -> HostError {
    let detail = format!("GitHub API {what} failed ({status}): {body}");
    match status {
        StatusCode::CONFLICT | StatusCode::METHOD_NOT_ALLOWED => HostError::Conflict(detail),
        StatusCode::NOT_FOUND => HostError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => HostError::RateLimited {
            retry_after: GhHttp::record_rate_limit(),
        },
        StatusCode::FORBIDDEN if is_rate_limit_body(body) => HostError::RateLimited {
            retry_after: GhHttp::record_rate_limit(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HostError::Auth(detail),
        s if s.is_server_error() => HostError::Transient(detail),
        _ => HostError::Other(anyhow::anyhow!(detail)),
    }
}

/// Parse the `Link` header to find the `rel="next"` URL.
fn parse_link_next(headers: &header::HeaderMap) -> Option<String> {
    let link = headers.get("link")?.to_str().ok()?;
    for part in link.split(',') {
        let part = part.trim();
        if part.contains("rel=\"next\"") {
            let start = part.find('<')? + 1;
            let end = part.find('>')?;
            return Some(part[start..end].to_string());
        }
    }
    None
}
