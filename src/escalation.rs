//! Escalation handler.
//!
//! Turns worker terminal states that need a human into durable records in an
//! append-only JSONL log, mirrors them to the notification channel and prints
//! a console banner. It never touches worker state.
//!
//! Records are idempotent per `(issue, category)` within an episode. An
//! episode ends when the issue is resolved (`manager resolve <id>`), which
//! appends a resolution marker to the same log. The log is replayed on open
//! so a restarted manager does not escalate the same condition twice, and
//! again whenever it changes on disk, so a resolution written by another
//! process reaches a running manager.

use crate::channels::{NotificationEvent, NotificationKind, NotificationSink};
use crate::status::WorkerStatus;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCategory {
    Blocked,
    Failed,
    Timeout,
    MainBranchFailed,
}

impl EscalationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::MainBranchFailed => "main_branch_failed",
        }
    }

    fn notification_kind(&self) -> NotificationKind {
        match self {
            Self::Blocked => NotificationKind::Blocked,
            Self::Failed | Self::Timeout => NotificationKind::Failed,
            Self::MainBranchFailed => NotificationKind::MainBranchFailed,
        }
    }
}

impl std::fmt::Display for EscalationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of a condition the worker could not resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRecord {
    pub issue_id: u64,
    pub category: EscalationCategory,
    pub reason: String,
    #[serde(default)]
    pub worker_status_snapshot: Option<WorkerStatus>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolutionMarker {
    resolved_issue_id: u64,
    resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum LogLine {
    Resolution(ResolutionMarker),
    Record(Box<EscalationRecord>),
}

/// Which escalation kinds print a console banner.
#[derive(Debug, Clone, Copy)]
pub struct BannerPolicy {
    pub on_block: bool,
    pub on_main_failure: bool,
}

impl Default for BannerPolicy {
    fn default() -> Self {
        Self {
            on_block: true,
            on_main_failure: true,
        }
    }
}

type OpenSet = HashMap<(u64, EscalationCategory), EscalationRecord>;

struct LogState {
    open: OpenSet,
    /// Log size the open set was replayed from.
    replayed_len: u64,
}

pub struct EscalationHandler {
    path: PathBuf,
    sink: Arc<dyn NotificationSink>,
    banners: BannerPolicy,
    state: Mutex<LogState>,
}

impl EscalationHandler {
    /// Open (or create) the escalation log and replay it.
    pub fn open(
        path: impl Into<PathBuf>,
        sink: Arc<dyn NotificationSink>,
        banners: BannerPolicy,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let replayed_len = log_len(&path)?;
        let open = replay(&path)?;
        if !open.is_empty() {
            tracing::info!(count = open.len(), "loaded unresolved escalations");
        }
        Ok(Self {
            path,
            sink,
            banners,
            state: Mutex::new(LogState { open, replayed_len }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log again if it changed since the last replay. Returns
    /// whether the open set was reloaded.
    pub fn refresh(&self) -> anyhow::Result<bool> {
        let mut state = self.lock()?;
        sync(&self.path, &mut state)
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, LogState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("escalation state poisoned"))
    }

    /// Record an escalation. Returns the existing record when the same
    /// `(issue, category)` is already open.
    pub async fn record(
        &self,
        issue_id: u64,
        category: EscalationCategory,
        reason: impl Into<String>,
        snapshot: Option<WorkerStatus>,
    ) -> anyhow::Result<EscalationRecord> {
        let record = {
            let mut state = self.lock()?;
            sync(&self.path, &mut state)?;
            if let Some(existing) = state.open.get(&(issue_id, category)) {
                tracing::debug!(issue = issue_id, %category, "escalation already open");
                return Ok(existing.clone());
            }
            let record = EscalationRecord {
                issue_id,
                category,
                reason: reason.into(),
                worker_status_snapshot: snapshot,
                created_at: Utc::now(),
            };
            append_line(&self.path, &LogLine::Record(Box::new(record.clone())))?;
            state.open.insert((issue_id, category), record.clone());
            record
        };

        tracing::warn!(issue = issue_id, %category, reason = %record.reason, "escalated");

        let mut event = NotificationEvent::new(
            category.notification_kind(),
            issue_id,
            format!("escalation ({category}): {}", record.reason),
        )
        .with("escalation", category.as_str());
        if let Some(pr) = record
            .worker_status_snapshot
            .as_ref()
            .and_then(|s| s.pr.as_ref())
        {
            event = event.with("prNumber", pr.number);
        }
        if let Err(e) = self.sink.append(&event).await {
            tracing::warn!(?e, issue = issue_id, "failed to mirror escalation to notifications");
        }

        if self.wants_banner(category) {
            eprintln!("{}", banner(&record));
        }
        Ok(record)
    }

    /// Close every open escalation for an issue. Returns how many were closed.
    pub fn resolve(&self, issue_id: u64) -> anyhow::Result<usize> {
        let mut state = self.lock()?;
        sync(&self.path, &mut state)?;
        let before = state.open.len();
        state.open.retain(|(id, _), _| *id != issue_id);
        let closed = before - state.open.len();
        append_line(
            &self.path,
            &LogLine::Resolution(ResolutionMarker {
                resolved_issue_id: issue_id,
                resolved_at: Utc::now(),
            }),
        )?;
        tracing::info!(issue = issue_id, closed, "escalations resolved");
        Ok(closed)
    }

    pub fn is_open(&self, issue_id: u64, category: EscalationCategory) -> bool {
        self.state
            .lock()
            .map(|state| state.open.contains_key(&(issue_id, category)))
            .unwrap_or(false)
    }

    /// Open escalations, oldest first.
    pub fn unresolved(&self) -> Vec<EscalationRecord> {
        let mut out: Vec<EscalationRecord> = self
            .state
            .lock()
            .map(|state| state.open.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|r| r.created_at);
        out
    }

    fn wants_banner(&self, category: EscalationCategory) -> bool {
        match category {
            EscalationCategory::Blocked => self.banners.on_block,
            EscalationCategory::MainBranchFailed => self.banners.on_main_failure,
            EscalationCategory::Failed | EscalationCategory::Timeout => false,
        }
    }
}

/// Every record in the log, resolved or not, in write order.
pub fn read_log(path: &Path) -> anyhow::Result<Vec<EscalationRecord>> {
    Ok(parse_log(path)?
        .into_iter()
        .filter_map(|line| match line {
            LogLine::Record(r) => Some(*r),
            LogLine::Resolution(_) => None,
        })
        .collect())
}

fn parse_log(path: &Path) -> anyhow::Result<Vec<LogLine>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let mut lines = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogLine>(line) {
            Ok(l) => lines.push(l),
            Err(e) => tracing::warn!(line = n + 1, ?e, "skipping malformed escalation line"),
        }
    }
    Ok(lines)
}

fn log_len(path: &Path) -> anyhow::Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Bring the open set up to date with the log on disk. Writes of our own
/// change the size too and cost one redundant replay.
fn sync(path: &Path, state: &mut LogState) -> anyhow::Result<bool> {
    let len = log_len(path)?;
    if len == state.replayed_len {
        return Ok(false);
    }
    state.open = replay(path)?;
    state.replayed_len = len;
    Ok(true)
}

fn replay(path: &Path) -> anyhow::Result<OpenSet> {
    let mut open = HashMap::new();
    for line in parse_log(path)? {
        match line {
            LogLine::Record(r) => {
                open.entry((r.issue_id, r.category)).or_insert(*r);
            }
            LogLine::Resolution(m) => open.retain(|(id, _), _| *id != m.resolved_issue_id),
        }
    }
    Ok(open)
}

fn append_line(path: &Path, line: &LogLine) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(line)?;
    json.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}

fn banner(record: &EscalationRecord) -> String {
    let rule = "=".repeat(60);
    let mut out = format!(
        "\n{rule}\nESCALATION: {}\nIssue: #{}\nReason: {}\n",
        record.category.as_str().to_uppercase(),
        record.issue_id,
        record.reason
    );
    if let Some(snapshot) = &record.worker_status_snapshot {
        if let Some(branch) = &snapshot.branch {
            out.push_str(&format!("Branch: {branch}\n"));
        }
        if let Some(pr) = &snapshot.pr {
            match &pr.url {
                Some(url) => out.push_str(&format!("PR: #{} {url}\n", pr.number)),
                None => out.push_str(&format!("PR: #{}\n", pr.number)),
            }
        }
    }
    out.push_str(&rule);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{JsonlNotificationSink, TailCursor};

    fn handler(dir: &Path) -> (EscalationHandler, Arc<JsonlNotificationSink>) {
        let sink = Arc::new(JsonlNotificationSink::new(dir.join("notifications.jsonl")).unwrap());
        let quiet = BannerPolicy {
            on_block: false,
            on_main_failure: false,
        };
        let h = EscalationHandler::open(dir.join("escalations.jsonl"), sink.clone(), quiet).unwrap();
        (h, sink)
    }

    #[tokio::test]
    async fn record_is_idempotent_per_issue_and_category() {
        let dir = tempfile::tempdir().unwrap();
        let (h, sink) = handler(dir.path());

        let first = h
            .record(4, EscalationCategory::Blocked, "merge conflict", None)
            .await
            .unwrap();
        let second = h
            .record(4, EscalationCategory::Blocked, "merge conflict again", None)
            .await
            .unwrap();
        assert_eq!(first.reason, second.reason);
        assert_eq!(read_log(h.path()).unwrap().len(), 1);

        h.record(4, EscalationCategory::Failed, "later failure", None)
            .await
            .unwrap();
        assert_eq!(read_log(h.path()).unwrap().len(), 2);

        let mut cursor = TailCursor::default();
        let events = sink.tail(&mut cursor).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, NotificationKind::Blocked);
        assert_eq!(events[0].payload["escalation"], "blocked");
    }

    #[tokio::test]
    async fn reopen_replays_unresolved_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (h, _) = handler(dir.path());
            h.record(9, EscalationCategory::MainBranchFailed, "main red", None)
                .await
                .unwrap();
        }
        let (h, _) = handler(dir.path());
        assert!(h.is_open(9, EscalationCategory::MainBranchFailed));
        h.record(9, EscalationCategory::MainBranchFailed, "main red", None)
            .await
            .unwrap();
        assert_eq!(read_log(h.path()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolve_starts_a_new_episode() {
        let dir = tempfile::tempdir().unwrap();
        let (h, _) = handler(dir.path());
        h.record(2, EscalationCategory::Timeout, "over budget", None)
            .await
            .unwrap();
        assert_eq!(h.resolve(2).unwrap(), 1);
        assert!(h.unresolved().is_empty());

        h.record(2, EscalationCategory::Timeout, "over budget again", None)
            .await
            .unwrap();
        assert_eq!(read_log(h.path()).unwrap().len(), 2);

        // resolution survives a reopen
        h.resolve(2).unwrap();
        let (reopened, _) = handler(dir.path());
        assert!(reopened.unresolved().is_empty());
    }

    #[tokio::test]
    async fn resolution_from_another_handle_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = handler(dir.path());
        manager
            .record(4, EscalationCategory::Blocked, "merge conflict", None)
            .await
            .unwrap();
        manager.refresh().unwrap();
        assert!(manager.is_open(4, EscalationCategory::Blocked));

        let (cli, _) = handler(dir.path());
        assert_eq!(cli.resolve(4).unwrap(), 1);

        assert!(manager.refresh().unwrap());
        assert!(!manager.is_open(4, EscalationCategory::Blocked));

        // A new episode for the same category is recorded, not suppressed.
        manager
            .record(4, EscalationCategory::Blocked, "conflict again", None)
            .await
            .unwrap();
        assert_eq!(read_log(manager.path()).unwrap().len(), 2);
        assert!(cli.refresh().unwrap());
        assert!(cli.is_open(4, EscalationCategory::Blocked));
    }

    #[test]
    fn banner_mentions_category_and_pr() {
        let mut snapshot = WorkerStatus::new(5, false);
        snapshot.branch = Some("worker/issue-5".into());
        let record = EscalationRecord {
            issue_id: 5,
            category: EscalationCategory::MainBranchFailed,
            reason: "build broke".into(),
            worker_status_snapshot: Some(snapshot),
            created_at: Utc::now(),
        };
        let text = banner(&record);
        assert!(text.contains("ESCALATION: MAIN_BRANCH_FAILED"));
        assert!(text.contains("Issue: #5"));
        assert!(text.contains("Branch: worker/issue-5"));
    }
}
