//! In-memory fakes of every seam a worker or the manager acts through.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover::channels::{NotificationEvent, NotificationSink, TailCursor};
use drover::config::{ManagerSettings, WorkerSettings};
use drover::engine::worker::git_ops::{RebaseOutcome, Vcs};
use drover::engine::worker::oracle::{
    ImplementationOracle, OracleError, OracleOutcome, OracleRequest, OracleTaskKind,
};
use drover::engine::worker::validate::{CheckResult, ValidationReport, Validator};
use drover::engine::worker::worktree::{Isolation, IsolationError, Worktree};
use drover::engine::worker::{branch_name, WorkerDeps};
use drover::host::{
    CiStatus, HostError, HostGateway, HostResult, Issue, MergeOutcome, Mergeability, NewIssue,
    NewPullRequest, PullRequest, ReviewComment, ReviewDecision,
};
use drover::status::{StatusStore, WorkerPhase, WorkerStatus};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn issue(number: u64, labels: &[&str]) -> Issue {
    Issue {
        number,
        title: format!("Fix pagination bug {number}"),
        body: "The last page of results is never shown.".into(),
        labels: labels.iter().map(|s| s.to_string()).collect(),
        linked_pr: None,
        url: None,
    }
}

pub fn comment(id: u64, body: &str, changes_requested: bool) -> ReviewComment {
    ReviewComment {
        id,
        author: "reviewer".into(),
        body: body.into(),
        path: Some("src/pager.rs".into()),
        line: Some(12),
        changes_requested,
        in_reply_to: None,
        created_at: Some(Utc::now()),
    }
}

/// Short timeouts; tests run with paused time so these never really elapse.
pub fn worker_settings() -> WorkerSettings {
    let mut s = WorkerSettings::from_lookup(|_| None);
    s.implement_attempts = 3;
    s.review_timeout = Duration::from_secs(30);
    s.review_poll = Duration::from_secs(5);
    s.ci_timeout = Duration::from_secs(60);
    s.ci_poll = Duration::from_secs(5);
    s.ci_max_fixes = 2;
    s.main_build_timeout = Duration::from_secs(30);
    s.main_poll = Duration::from_secs(5);
    s.merge_wait = Duration::from_secs(30);
    s.auto_merge = true;
    s.dry_run = false;
    s
}

pub fn manager_settings() -> ManagerSettings {
    let mut s = ManagerSettings::from_lookup(|_| None);
    s.max_workers = 2;
    s.issue_poll = Duration::ZERO;
    s.worker_poll = Duration::from_secs(1);
    s
}

// --- host ---

#[derive(Default)]
pub struct FakeGateway {
    pub issues: Mutex<BTreeMap<u64, Issue>>,
    pub prs: Mutex<BTreeMap<String, PullRequest>>,
    pub comments: Mutex<Vec<ReviewComment>>,
    /// `None` reads as pending.
    pub decision: Mutex<Option<ReviewDecision>>,
    pub decision_unavailable: Mutex<bool>,
    /// Successive CI answers; the last one repeats. Empty means success.
    pub ci: Mutex<VecDeque<CiStatus>>,
    pub mergeability: Mutex<Option<Mergeability>>,
    pub merge_conflict: Mutex<bool>,
    pub main_status: Mutex<Option<CiStatus>>,
    pub created_issues: Mutex<Vec<NewIssue>>,
    pub merges: AtomicUsize,
    pub pr_creations: AtomicUsize,
}

impl FakeGateway {
    pub fn with_issues(issues: Vec<Issue>) -> Arc<Self> {
        let gw = Self::default();
        {
            let mut map = gw.issues.lock().unwrap();
            for i in issues {
                map.insert(i.number, i);
            }
        }
        Arc::new(gw)
    }

    pub fn set_ci(&self, script: &[CiStatus]) {
        *self.ci.lock().unwrap() = script.iter().copied().collect();
    }

    pub fn set_decision(&self, decision: ReviewDecision) {
        *self.decision.lock().unwrap() = Some(decision);
    }

    pub fn set_main(&self, status: CiStatus) {
        *self.main_status.lock().unwrap() = Some(status);
    }

    /// Host-side writes: PRs opened, issues filed, merges.
    pub fn mutations(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
            + self.pr_creations.load(Ordering::SeqCst)
            + self.created_issues.lock().unwrap().len()
    }
}

#[async_trait]
impl HostGateway for FakeGateway {
    fn repo(&self) -> &str {
        "acme/widgets"
    }

    async fn get_issue(&self, number: u64) -> HostResult<Issue> {
        self.issues
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("issue #{number}")))
    }

    async fn list_open_issues(&self, labels: &[String]) -> HostResult<Vec<Issue>> {
        Ok(self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|i| labels.is_empty() || i.labels.iter().any(|l| labels.contains(l)))
            .cloned()
            .collect())
    }

    async fn default_branch(&self) -> HostResult<String> {
        Ok("main".into())
    }

    async fn find_pr(&self, head_branch: &str) -> HostResult<Option<PullRequest>> {
        Ok(self.prs.lock().unwrap().get(head_branch).cloned())
    }

    async fn find_or_create_pr(&self, pr: &NewPullRequest) -> HostResult<PullRequest> {
        let mut prs = self.prs.lock().unwrap();
        if let Some(existing) = prs.get(&pr.head) {
            return Ok(existing.clone());
        }
        self.pr_creations.fetch_add(1, Ordering::SeqCst);
        let created = PullRequest {
            number: 100 + prs.len() as u64,
            head_branch: pr.head.clone(),
            url: Some(format!("https://example.test/pull/{}", 100 + prs.len())),
            merged: false,
            merge_commit: None,
        };
        prs.insert(pr.head.clone(), created.clone());
        Ok(created)
    }

    async fn get_pr(&self, number: u64) -> HostResult<PullRequest> {
        self.prs
            .lock()
            .unwrap()
            .values()
            .find(|p| p.number == number)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("PR #{number}")))
    }

    async fn list_review_comments(
        &self,
        _pr: u64,
        _since: Option<DateTime<Utc>>,
    ) -> HostResult<Vec<ReviewComment>> {
        Ok(self.comments.lock().unwrap().clone())
    }

    async fn review_decision(&self, _pr: u64) -> HostResult<ReviewDecision> {
        if *self.decision_unavailable.lock().unwrap() {
            return Err(HostError::Auth("review listing forbidden".into()));
        }
        Ok(self
            .decision
            .lock()
            .unwrap()
            .unwrap_or(ReviewDecision::Pending))
    }

    async fn ci_status(&self, _pr: u64) -> HostResult<CiStatus> {
        let mut script = self.ci.lock().unwrap();
        let status = match script.len() {
            0 => CiStatus::Success,
            1 => script[0],
            _ => script.pop_front().unwrap_or(CiStatus::Success),
        };
        Ok(status)
    }

    async fn failing_check_logs(&self, _pr: u64) -> HostResult<String> {
        Ok("test pager::last_page ... FAILED".into())
    }

    async fn mergeability(&self, _pr: u64) -> HostResult<Mergeability> {
        Ok(self.mergeability.lock().unwrap().unwrap_or(Mergeability::Clean))
    }

    async fn merge_squash(&self, pr: u64, _title: &str) -> HostResult<MergeOutcome> {
        if *self.merge_conflict.lock().unwrap() {
            return Err(HostError::Conflict("base branch was modified".into()));
        }
        self.merges.fetch_add(1, Ordering::SeqCst);
        Ok(MergeOutcome {
            sha: format!("merge-{pr}"),
        })
    }

    async fn main_build_status(&self, _git_ref: &str) -> HostResult<CiStatus> {
        Ok(self.main_status.lock().unwrap().unwrap_or(CiStatus::Success))
    }

    async fn create_issue(&self, issue: &NewIssue) -> HostResult<u64> {
        let mut created = self.created_issues.lock().unwrap();
        created.push(issue.clone());
        Ok(500 + created.len() as u64)
    }
}

// --- version control ---

#[derive(Default)]
pub struct FakeVcs {
    dirty: Mutex<bool>,
    commits: Mutex<Vec<String>>,
    pub pushes: AtomicUsize,
    pub force_pushes: AtomicUsize,
    pub rebase: Mutex<Option<RebaseOutcome>>,
}

impl FakeVcs {
    /// Simulate the oracle editing files.
    pub fn touch(&self) {
        *self.dirty.lock().unwrap() = true;
    }

    pub fn seed_commit(&self, sha: &str) {
        self.commits.lock().unwrap().push(sha.into());
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn commit_all(&self, _dir: &Path, _message: &str) -> anyhow::Result<Option<String>> {
        let mut dirty = self.dirty.lock().unwrap();
        if !*dirty {
            return Ok(None);
        }
        *dirty = false;
        let mut commits = self.commits.lock().unwrap();
        let sha = format!("{:040x}", commits.len() + 1);
        commits.push(sha.clone());
        Ok(Some(sha))
    }

    async fn commits_since(&self, _dir: &Path, _base: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.commits.lock().unwrap().clone())
    }

    async fn push(&self, _dir: &Path, _branch: &str, force: bool) -> anyhow::Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if force {
            self.force_pushes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn rebase_onto(&self, _dir: &Path, _base: &str) -> anyhow::Result<RebaseOutcome> {
        Ok(self
            .rebase
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(RebaseOutcome::Clean))
    }

    async fn restore_protected(
        &self,
        _dir: &Path,
        _base: &str,
        _patterns: &[String],
    ) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

// --- oracle ---

pub struct FakeOracle {
    vcs: Arc<FakeVcs>,
    /// Whether a successful run leaves changes behind.
    pub edits: Mutex<bool>,
    pub unavailable: Mutex<bool>,
    /// Fail every run with a retryable error.
    pub failing: Mutex<bool>,
    pub calls: Mutex<Vec<OracleTaskKind>>,
}

impl FakeOracle {
    pub fn new(vcs: Arc<FakeVcs>) -> Arc<Self> {
        Arc::new(Self {
            vcs,
            edits: Mutex::new(true),
            unavailable: Mutex::new(false),
            failing: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<OracleTaskKind> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImplementationOracle for FakeOracle {
    async fn run(&self, request: &OracleRequest) -> Result<OracleOutcome, OracleError> {
        self.calls.lock().unwrap().push(request.kind);
        if *self.unavailable.lock().unwrap() {
            return Err(OracleError::Unavailable("credit balance is too low".into()));
        }
        if *self.failing.lock().unwrap() {
            return Err(OracleError::Failed("exited with status 1".into()));
        }
        if *self.edits.lock().unwrap() {
            self.vcs.touch();
        }
        Ok(OracleOutcome {
            summary: "Fixed the off-by-one in the pager.".into(),
        })
    }
}

// --- validation ---

#[derive(Default)]
pub struct FakeValidator {
    /// Successive results; empty means pass.
    pub script: Mutex<VecDeque<bool>>,
    pub runs: AtomicUsize,
}

impl FakeValidator {
    pub fn scripted(results: &[bool]) -> Arc<Self> {
        let v = Self::default();
        *v.script.lock().unwrap() = results.iter().copied().collect();
        Arc::new(v)
    }
}

#[async_trait]
impl Validator for FakeValidator {
    async fn validate(&self, _dir: &Path) -> anyhow::Result<ValidationReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let passed = self.script.lock().unwrap().pop_front().unwrap_or(true);
        Ok(ValidationReport {
            project: None,
            checks: vec![CheckResult {
                name: "test".into(),
                command: "cargo test".into(),
                passed,
                output: if passed { String::new() } else { "1 test failed".into() },
            }],
        })
    }
}

// --- isolation ---

#[derive(Default)]
pub struct FakeIsolation {
    holders: Mutex<BTreeMap<u64, String>>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl FakeIsolation {
    pub fn hold(&self, issue_id: u64, owner: &str) {
        self.holders.lock().unwrap().insert(issue_id, owner.into());
    }

    pub fn is_held(&self, issue_id: u64) -> bool {
        self.holders.lock().unwrap().contains_key(&issue_id)
    }
}

#[async_trait]
impl Isolation for FakeIsolation {
    async fn acquire(&self, issue_id: u64, owner: &str) -> Result<Worktree, IsolationError> {
        let mut holders = self.holders.lock().unwrap();
        if let Some(holder) = holders.get(&issue_id) {
            if holder != owner {
                return Err(IsolationError::Busy {
                    issue: issue_id,
                    pid: 1,
                });
            }
        }
        holders.insert(issue_id, owner.into());
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Worktree {
            issue_id,
            path: PathBuf::from(format!("/work/issue-{issue_id}")),
            branch: branch_name(issue_id),
            base: "origin/main".into(),
        })
    }

    async fn release(&self, worktree: &Worktree, owner: &str) {
        let mut holders = self.holders.lock().unwrap();
        if holders.get(&worktree.issue_id).map(String::as_str) == Some(owner) {
            holders.remove(&worktree.issue_id);
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// --- status and notifications ---

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<u64, WorkerStatus>>,
    /// Every phase written, in order, per issue.
    pub history: Mutex<BTreeMap<u64, Vec<WorkerPhase>>>,
    pub archived: Mutex<Vec<u64>>,
}

impl MemoryStore {
    pub fn put(&self, status: WorkerStatus) {
        self.docs.lock().unwrap().insert(status.issue_id, status);
    }

    pub fn get(&self, issue_id: u64) -> Option<WorkerStatus> {
        self.docs.lock().unwrap().get(&issue_id).cloned()
    }

    /// Distinct phases in the order they were first written.
    pub fn phases(&self, issue_id: u64) -> Vec<WorkerPhase> {
        let history = self.history.lock().unwrap();
        let mut out: Vec<WorkerPhase> = Vec::new();
        for phase in history.get(&issue_id).into_iter().flatten() {
            if out.last() != Some(phase) {
                out.push(*phase);
            }
        }
        out
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn read(&self, issue_id: u64) -> anyhow::Result<Option<WorkerStatus>> {
        Ok(self.get(issue_id))
    }

    async fn write(&self, status: &WorkerStatus) -> anyhow::Result<()> {
        self.history
            .lock()
            .unwrap()
            .entry(status.issue_id)
            .or_default()
            .push(status.phase);
        self.put(status.clone());
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<WorkerStatus>> {
        Ok(self.docs.lock().unwrap().values().cloned().collect())
    }

    async fn archive(&self, issue_id: u64) -> anyhow::Result<bool> {
        let removed = self.docs.lock().unwrap().remove(&issue_id).is_some();
        if removed {
            self.archived.lock().unwrap().push(issue_id);
        }
        Ok(removed)
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub events: Mutex<Vec<NotificationEvent>>,
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn append(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn tail(&self, cursor: &mut TailCursor) -> anyhow::Result<Vec<NotificationEvent>> {
        let events = self.events.lock().unwrap();
        let start = (cursor.offset as usize).min(events.len());
        cursor.offset = events.len() as u64;
        Ok(events[start..].to_vec())
    }
}

/// A complete set of fakes wired together.
pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub vcs: Arc<FakeVcs>,
    pub oracle: Arc<FakeOracle>,
    pub validator: Arc<FakeValidator>,
    pub isolation: Arc<FakeIsolation>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new(issues: Vec<Issue>) -> Self {
        let vcs = Arc::new(FakeVcs::default());
        Self {
            gateway: FakeGateway::with_issues(issues),
            oracle: FakeOracle::new(vcs.clone()),
            vcs,
            validator: Arc::new(FakeValidator::default()),
            isolation: Arc::new(FakeIsolation::default()),
            store: Arc::new(MemoryStore::default()),
            sink: Arc::new(MemorySink::default()),
        }
    }

    pub fn deps(&self) -> WorkerDeps {
        self.deps_with_gateway(self.gateway.clone())
    }

    pub fn deps_with_gateway(&self, gateway: Arc<dyn HostGateway>) -> WorkerDeps {
        WorkerDeps {
            gateway,
            oracle: self.oracle.clone(),
            isolation: self.isolation.clone(),
            vcs: self.vcs.clone(),
            validator: self.validator.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
        }
    }
}
