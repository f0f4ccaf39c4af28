//! Worker status documents, one JSON file per issue.
//!
//! The document is the single source of truth for a worker's phase, logs and
//! metrics, and doubles as the crash-recovery record: a restarted worker
//! resumes from the phase stored here. Exactly one writer (the owning worker)
//! touches a given document; the manager and CLI only read.
//!
//! Storage sits behind [`StatusStore`] so the state machine never sees the
//! filesystem directly.

use crate::host::CiStatus;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Most recent log entries kept in a document.
pub const MAX_LOG_ENTRIES: usize = 500;

/// Lifecycle phase of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Initialize,
    Implement,
    Validate,
    CreatePr,
    ReviewLoop,
    CiLoop,
    Merge,
    VerifyMain,
    Completed,
    Blocked,
    Failed,
    MainBranchFailed,
    /// Cancelled by the manager (wall-clock budget exceeded).
    Abandoned,
}

impl WorkerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Blocked | Self::Failed | Self::MainBranchFailed | Self::Abandoned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Implement => "implement",
            Self::Validate => "validate",
            Self::CreatePr => "create_pr",
            Self::ReviewLoop => "review_loop",
            Self::CiLoop => "ci_loop",
            Self::Merge => "merge",
            Self::VerifyMain => "verify_main",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::MainBranchFailed => "main_branch_failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// The pull request a worker opened for its issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrRef {
    pub number: u64,
    pub head_branch: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Review comments already acted on. Never re-processed.
    #[serde(default)]
    pub processed_comment_ids: BTreeSet<u64>,
    pub opened_at: DateTime<Utc>,
}

/// Persisted state of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub issue_id: u64,
    #[serde(default)]
    pub title: String,
    pub phase: WorkerPhase,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub commits: Vec<String>,
    /// Oracle attempts spent in IMPLEMENT and VALIDATE.
    #[serde(default)]
    pub oracle_attempts: u32,
    #[serde(default)]
    pub pr: Option<PrRef>,
    #[serde(default)]
    pub created_issues: Vec<u64>,
    #[serde(default)]
    pub ci_status: Option<CiStatus>,
    #[serde(default)]
    pub ci_fix_attempts: u32,
    #[serde(default)]
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub main_branch_verified: bool,
    /// Human-readable reason attached to every terminal phase.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn new(issue_id: u64, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            issue_id,
            title: String::new(),
            phase: WorkerPhase::Initialize,
            dry_run,
            pid: std::process::id(),
            branch: None,
            worktree_path: None,
            commits: Vec::new(),
            oracle_attempts: 0,
            pr: None,
            created_issues: Vec::new(),
            ci_status: None,
            ci_fix_attempts: 0,
            merge_commit: None,
            main_branch_verified: false,
            reason: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a log entry, dropping the oldest past [`MAX_LOG_ENTRIES`].
    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
        if self.logs.len() > MAX_LOG_ENTRIES {
            let excess = self.logs.len() - MAX_LOG_ENTRIES;
            self.logs.drain(..excess);
        }
    }

    /// Record commits, skipping ones already known.
    pub fn add_commits<I: IntoIterator<Item = String>>(&mut self, shas: I) {
        for sha in shas {
            if !self.commits.contains(&sha) {
                self.commits.push(sha);
            }
        }
    }

    pub fn is_processed(&self, comment_id: u64) -> bool {
        self.pr
            .as_ref()
            .is_some_and(|pr| pr.processed_comment_ids.contains(&comment_id))
    }

    pub fn last_log(&self) -> Option<&LogEntry> {
        self.logs.last()
    }
}

/// Read/write access to worker status documents.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Fetch the document for an issue, `None` when it was never written.
    async fn read(&self, issue_id: u64) -> anyhow::Result<Option<WorkerStatus>>;

    /// Replace the document for `status.issue_id`.
    async fn write(&self, status: &WorkerStatus) -> anyhow::Result<()>;

    /// All documents currently in the store.
    async fn list(&self) -> anyhow::Result<Vec<WorkerStatus>>;

    /// Move a document out of the live set. Returns false if it did not exist.
    async fn archive(&self, issue_id: u64) -> anyhow::Result<bool>;
}

/// Status documents as `worker-{issue}.json` files in a directory.
#[derive(Debug, Clone)]
pub struct FsStatusStore {
    dir: PathBuf,
}

impl FsStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating status dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, issue_id: u64) -> PathBuf {
        self.dir.join(format!("worker-{issue_id}.json"))
    }
}

#[async_trait]
impl StatusStore for FsStatusStore {
    async fn read(&self, issue_id: u64) -> anyhow::Result<Option<WorkerStatus>> {
        read_json(&self.path_for(issue_id))
    }

    async fn write(&self, status: &WorkerStatus) -> anyhow::Result<()> {
        write_json_atomic(&self.path_for(status.issue_id), status)
    }

    async fn list(&self) -> anyhow::Result<Vec<WorkerStatus>> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("listing {}", self.dir.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.starts_with("worker-") && name.ends_with(".json")) {
                continue;
            }
            match read_json::<WorkerStatus>(&entry.path()) {
                Ok(Some(status)) => out.push(status),
                Ok(None) => {}
                Err(e) => tracing::warn!(file = %name, ?e, "skipping unreadable status document"),
            }
        }
        out.sort_by_key(|s| s.issue_id);
        Ok(out)
    }

    async fn archive(&self, issue_id: u64) -> anyhow::Result<bool> {
        let src = self.path_for(issue_id);
        if !src.exists() {
            return Ok(false);
        }
        let archive_dir = self.dir.join("archive");
        std::fs::create_dir_all(&archive_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let dest = archive_dir.join(format!("worker-{issue_id}-{stamp}.json"));
        std::fs::rename(&src, &dest)
            .with_context(|| format!("archiving {} to {}", src.display(), dest.display()))?;
        tracing::info!(issue = issue_id, dest = %dest.display(), "archived status document");
        Ok(true)
    }
}

/// Read a JSON file, `None` if it does not exist.
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let value =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Write JSON via a temp file + rename so readers never see a torn document.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "status".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
