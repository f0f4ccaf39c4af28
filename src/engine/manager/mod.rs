//! The manager: finds eligible issues, keeps up to `max_workers` workers
//! busy, watches their status documents and escalates terminal failures.
//!
//! The manager never writes a worker's document and never retries a
//! finished or stalled issue on its own; `manager resolve` (a human) closes
//! an episode and only then can the issue be picked up again.

pub mod pool;

use self::pool::{Pool, WorkerSpawner};
use crate::channels::{NotificationSink, TailCursor};
use crate::config::ManagerSettings;
use crate::escalation::{EscalationCategory, EscalationHandler};
use crate::host::{HostGateway, Issue};
use crate::status::{read_json, write_json_atomic, StatusStore, WorkerPhase, WorkerStatus};
use crate::triage::{self, Complexity};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct ManagerDeps {
    pub gateway: Arc<dyn HostGateway>,
    pub store: Arc<dyn StatusStore>,
    pub sink: Arc<dyn NotificationSink>,
    pub escalations: Arc<EscalationHandler>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

/// One row of the manager status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub issue_id: u64,
    pub title: String,
    pub phase: WorkerPhase,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Whether the worker is running under this manager.
    #[serde(default)]
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

/// `{status_dir}/manager.json`, rewritten every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub repo: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_poll: Option<DateTime<Utc>>,
    pub max_workers: usize,
    pub issues_tracked: usize,
    pub workers_active: usize,
    pub workers_completed: usize,
    pub workers_failed: usize,
    pub prs_merged: usize,
    pub main_failures: usize,
    pub escalations: usize,
    #[serde(default)]
    pub workers: Vec<WorkerSummary>,
}

impl ManagerStatus {
    pub fn read(path: &Path) -> anyhow::Result<Option<Self>> {
        read_json(path)
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub spawned: Vec<u64>,
    pub finished: Vec<(u64, WorkerPhase)>,
    pub escalated: Vec<u64>,
    pub cancelled: Vec<u64>,
}

/// Escalation category for a terminal phase, `None` for success.
pub fn escalation_category(phase: WorkerPhase) -> Option<EscalationCategory> {
    match phase {
        WorkerPhase::Blocked => Some(EscalationCategory::Blocked),
        WorkerPhase::Failed => Some(EscalationCategory::Failed),
        WorkerPhase::MainBranchFailed => Some(EscalationCategory::MainBranchFailed),
        WorkerPhase::Abandoned => Some(EscalationCategory::Timeout),
        _ => None,
    }
}

/// Complexity of an issue the manager would hand to a worker, or `None`
/// when it is not eligible.
pub fn eligibility(issue: &Issue, allow: &[String], deny: &[String]) -> Option<Complexity> {
    let has = |wanted: &[String]| {
        issue
            .labels
            .iter()
            .any(|l| wanted.iter().any(|w| w.eq_ignore_ascii_case(l)))
    };
    if !allow.is_empty() && !has(allow) {
        return None;
    }
    if has(deny) || issue.linked_pr.is_some() {
        return None;
    }
    match triage::classify(&issue.labels, &issue.title, &issue.body) {
        Complexity::Epic => None,
        complexity => Some(complexity),
    }
}

pub struct Manager {
    repo: String,
    settings: ManagerSettings,
    deps: ManagerDeps,
    pool: Pool,
    cursor: TailCursor,
    status_file: PathBuf,
    started_at: DateTime<Utc>,
    last_issue_poll: Option<Instant>,
    last_poll: Option<DateTime<Utc>>,
    status: Option<ManagerStatus>,
}

impl Manager {
    /// `cursor` is where notification tailing starts; pass the log's end to
    /// skip history.
    pub fn new(
        repo: impl Into<String>,
        settings: ManagerSettings,
        deps: ManagerDeps,
        status_file: PathBuf,
        cursor: TailCursor,
    ) -> Self {
        Self {
            repo: repo.into(),
            pool: Pool::new(settings.max_workers),
            settings,
            deps,
            cursor,
            status_file,
            started_at: Utc::now(),
            last_issue_poll: None,
            last_poll: None,
            status: None,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn status(&self) -> Option<&ManagerStatus> {
        self.status.as_ref()
    }

    pub fn active_workers(&self) -> Vec<u64> {
        self.pool.issue_ids()
    }

    /// Swap in reloaded settings. Running workers are untouched.
    pub fn apply_settings(&mut self, settings: ManagerSettings) {
        if settings != self.settings {
            tracing::info!(
                max_workers = settings.max_workers,
                allow = ?settings.allow_labels,
                deny = ?settings.deny_labels,
                "manager settings reloaded"
            );
        }
        self.pool.set_capacity(settings.max_workers);
        self.settings = settings;
    }

    /// One scheduling round: drain notifications, reap and escalate
    /// finished workers, cancel overdue ones, start new ones if the issue
    /// poll is due, then rewrite the manager status file.
    pub async fn tick(&mut self) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();
        self.drain_notifications().await;
        if let Err(e) = self.deps.escalations.refresh() {
            tracing::warn!(err = %format!("{e:#}"), "could not reload the escalation log");
        }

        let mut docs: BTreeMap<u64, WorkerStatus> = self
            .deps
            .store
            .list()
            .await?
            .into_iter()
            .map(|d| (d.issue_id, d))
            .collect();

        self.reap(&mut docs, &mut report).await;
        self.escalate(&docs, &mut report).await;

        for issue_id in self.pool.overdue(self.settings.worker_timeout) {
            if let Some(entry) = self.pool.get(issue_id) {
                tracing::warn!(
                    issue = issue_id,
                    budget_secs = self.settings.worker_timeout.as_secs(),
                    "worker exceeded its wall-clock budget, cancelling"
                );
                entry.cancel();
                report.cancelled.push(issue_id);
            }
        }

        let due = self
            .last_issue_poll
            .is_none_or(|at| at.elapsed() >= self.settings.issue_poll);
        if due {
            self.last_issue_poll = Some(Instant::now());
            self.last_poll = Some(Utc::now());
            if let Err(e) = self.schedule(&docs, &mut report).await {
                tracing::warn!(err = %format!("{e:#}"), "issue poll failed");
            }
        }

        self.write_status(&docs)?;
        Ok(report)
    }

    async fn drain_notifications(&mut self) {
        let events = match self.deps.sink.tail(&mut self.cursor).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(?e, "could not read notifications");
                return;
            }
        };
        for event in events {
            if self.pool.contains(event.issue_id) {
                tracing::info!(issue = event.issue_id, kind = event.kind.as_str(), "{}", event.message());
            } else {
                tracing::debug!(issue = event.issue_id, kind = event.kind.as_str(), "event for untracked issue");
            }
        }
    }

    /// Drop pool entries whose document is terminal or whose task died
    /// without getting there. `docs` is a snapshot from the start of the
    /// tick; a worker that exited since is re-read before being judged.
    async fn reap(&mut self, docs: &mut BTreeMap<u64, WorkerStatus>, report: &mut TickReport) {
        for issue_id in self.pool.issue_ids() {
            let exited = self.pool.get(issue_id).is_some_and(|e| e.is_finished());
            let stale = docs.get(&issue_id).is_none_or(|d| !d.phase.is_terminal());
            if exited && stale {
                match self.deps.store.read(issue_id).await {
                    Ok(Some(fresh)) => {
                        docs.insert(issue_id, fresh);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(issue = issue_id, ?e, "could not re-read status document"),
                }
            }

            let doc = docs.get(&issue_id);
            match doc {
                Some(d) if d.phase.is_terminal() => {
                    tracing::info!(issue = issue_id, phase = %d.phase, "worker reached a terminal phase");
                    self.pool.remove(issue_id);
                    report.finished.push((issue_id, d.phase));
                }
                _ if exited => {
                    self.pool.remove(issue_id);
                    let phase = doc.map(|d| d.phase.as_str()).unwrap_or("startup");
                    let reason = format!("worker exited during {phase} without reaching a terminal phase");
                    match self
                        .deps
                        .escalations
                        .record(issue_id, EscalationCategory::Failed, reason, doc.cloned())
                        .await
                    {
                        Ok(_) => report.escalated.push(issue_id),
                        Err(e) => tracing::error!(issue = issue_id, ?e, "could not record escalation"),
                    }
                }
                _ => {}
            }
        }
    }

    /// Escalate every terminal failure once per episode.
    async fn escalate(&mut self, docs: &BTreeMap<u64, WorkerStatus>, report: &mut TickReport) {
        for doc in docs.values() {
            let Some(category) = escalation_category(doc.phase) else {
                continue;
            };
            if self.deps.escalations.is_open(doc.issue_id, category) {
                continue;
            }
            let reason = doc
                .reason
                .clone()
                .unwrap_or_else(|| format!("worker ended in {}", doc.phase));
            match self
                .deps
                .escalations
                .record(doc.issue_id, category, reason, Some(doc.clone()))
                .await
            {
                Ok(_) => report.escalated.push(doc.issue_id),
                Err(e) => tracing::error!(issue = doc.issue_id, ?e, "could not record escalation"),
            }
        }
    }

    async fn schedule(
        &mut self,
        docs: &BTreeMap<u64, WorkerStatus>,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let issues = self
            .deps
            .gateway
            .list_open_issues(&self.settings.allow_labels)
            .await
            .context("listing open issues")?;

        let mut candidates: Vec<(Complexity, Issue)> = issues
            .into_iter()
            .filter_map(|issue| {
                eligibility(&issue, &self.settings.allow_labels, &self.settings.deny_labels)
                    .map(|c| (c, issue))
            })
            .collect();
        candidates.sort_by_key(|(c, issue)| (*c, issue.number));
        tracing::debug!(eligible = candidates.len(), "polled issues");

        let escalated: Vec<u64> = self
            .deps
            .escalations
            .unresolved()
            .iter()
            .map(|r| r.issue_id)
            .collect();

        for (complexity, issue) in candidates {
            if !self.pool.has_capacity() {
                break;
            }
            if self.pool.contains(issue.number) || escalated.contains(&issue.number) {
                continue;
            }
            if let Some(doc) = docs.get(&issue.number) {
                tracing::debug!(
                    issue = issue.number,
                    phase = %doc.phase,
                    "status document exists, not spawning"
                );
                continue;
            }
            match self.pool.start(&issue, self.deps.spawner.as_ref()) {
                Ok(()) => {
                    tracing::info!(issue = issue.number, %complexity, title = %issue.title, "spawned worker");
                    report.spawned.push(issue.number);
                }
                Err(e) => tracing::error!(issue = issue.number, err = %format!("{e:#}"), "could not spawn worker"),
            }
        }
        Ok(())
    }

    fn write_status(&mut self, docs: &BTreeMap<u64, WorkerStatus>) -> anyhow::Result<()> {
        let count = |pred: fn(&WorkerStatus) -> bool| docs.values().filter(|d| pred(d)).count();
        let status = ManagerStatus {
            repo: self.repo.clone(),
            pid: std::process::id(),
            started_at: self.started_at,
            last_poll: self.last_poll,
            max_workers: self.pool.capacity(),
            issues_tracked: docs.len(),
            workers_active: self.pool.len(),
            workers_completed: count(|d| d.phase == WorkerPhase::Completed),
            workers_failed: count(|d| {
                matches!(d.phase, WorkerPhase::Failed | WorkerPhase::Abandoned)
            }),
            prs_merged: count(|d| d.merge_commit.is_some()),
            main_failures: count(|d| d.phase == WorkerPhase::MainBranchFailed),
            escalations: self.deps.escalations.unresolved().len(),
            workers: docs
                .values()
                .map(|d| WorkerSummary {
                    issue_id: d.issue_id,
                    title: d.title.clone(),
                    phase: d.phase,
                    pr_number: d.pr.as_ref().map(|p| p.number),
                    reason: d.reason.clone(),
                    active: self.pool.contains(d.issue_id),
                    updated_at: d.updated_at,
                })
                .collect(),
        };
        write_json_atomic(&self.status_file, &status)
            .with_context(|| format!("writing {}", self.status_file.display()))?;
        self.status = Some(status);
        Ok(())
    }

    /// Tick every `worker_poll` until SIGINT, SIGTERM or `shutdown`.
    ///
    /// `reload` rebuilds settings when a config file changes (the caller
    /// re-applies its CLI overrides); `on_tick` sees the fresh status after
    /// each round.
    pub async fn serve(
        mut self,
        shutdown: CancellationToken,
        reload: impl Fn() -> ManagerSettings,
        mut on_tick: impl FnMut(&ManagerStatus),
    ) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.settings.worker_poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut config_changes = crate::config::subscribe();
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tracing::info!(
            repo = %self.repo,
            max_workers = self.settings.max_workers,
            poll_secs = self.settings.worker_poll.as_secs(),
            "manager started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => {
                            if !report.spawned.is_empty() || !report.finished.is_empty() {
                                tracing::info!(?report, "tick");
                            }
                            if let Some(status) = &self.status {
                                on_tick(status);
                            }
                        }
                        Err(e) => tracing::error!(err = %format!("{e:#}"), "tick failed"),
                    }
                }
                changed = config_changes.recv() => {
                    if let Ok(path) = changed {
                        tracing::debug!(path = %path.display(), "config changed");
                        self.apply_settings(reload());
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
                _ = shutdown.cancelled() => break,
            }
        }

        if !self.pool.is_empty() {
            tracing::info!(
                workers = ?self.pool.issue_ids(),
                "leaving unfinished workers; resume them with `drover worker run`"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(n: u64, labels: &[&str]) -> Issue {
        Issue {
            number: n,
            title: "Fix off-by-one in pager".into(),
            body: "The last page is skipped.".into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            linked_pr: None,
            url: None,
        }
    }

    fn labels(l: &[&str]) -> Vec<String> {
        l.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn eligibility_rules() {
        let allow = labels(&["bug", "enhancement"]);
        let deny = labels(&["wontfix"]);

        assert!(eligibility(&issue(1, &["bug"]), &allow, &deny).is_some());
        assert!(eligibility(&issue(1, &["Bug"]), &allow, &deny).is_some());
        assert!(eligibility(&issue(2, &["question"]), &allow, &deny).is_none());
        assert!(eligibility(&issue(3, &["bug", "wontfix"]), &allow, &deny).is_none());
        assert!(eligibility(&issue(4, &["bug", "epic"]), &allow, &deny).is_none());

        let mut linked = issue(5, &["bug"]);
        linked.linked_pr = Some(12);
        assert!(eligibility(&linked, &allow, &deny).is_none());

        // an empty allow list admits anything not denied
        assert!(eligibility(&issue(6, &[]), &[], &deny).is_some());
    }

    #[test]
    fn terminal_phases_map_to_categories() {
        assert_eq!(escalation_category(WorkerPhase::Completed), None);
        assert_eq!(escalation_category(WorkerPhase::ReviewLoop), None);
        assert_eq!(
            escalation_category(WorkerPhase::Abandoned),
            Some(EscalationCategory::Timeout)
        );
        assert_eq!(
            escalation_category(WorkerPhase::MainBranchFailed),
            Some(EscalationCategory::MainBranchFailed)
        );
    }
}
