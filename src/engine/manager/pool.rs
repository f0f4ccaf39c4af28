//! Running workers, keyed by issue.
//!
//! The pool only tracks liveness and cancellation. Everything about a
//! worker's progress is read from its status document.

use crate::cmd::{CommandErrorContext, SyncCommandErrorContext};
use crate::config::WorkerSettings;
use crate::engine::worker::{Worker, WorkerDeps};
use crate::host::Issue;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Starts a worker for an issue. The returned task finishes when the
/// worker does; cancelling the token must make the worker write its
/// `abandoned` phase and exit.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, issue: &Issue, cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>>;
}

/// Workers as tokio tasks in this process.
pub struct InProcessSpawner {
    settings: WorkerSettings,
    deps: WorkerDeps,
}

impl InProcessSpawner {
    pub fn new(settings: WorkerSettings, deps: WorkerDeps) -> Self {
        Self { settings, deps }
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, issue: &Issue, cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let worker = Worker::new(issue.number, self.settings.clone(), self.deps.clone());
        let issue_id = issue.number;
        Ok(tokio::spawn(async move {
            match worker.run(cancel).await {
                Ok(status) => {
                    tracing::info!(issue = issue_id, phase = %status.phase, "worker finished")
                }
                Err(e) => tracing::error!(issue = issue_id, err = %format!("{e:#}"), "worker error"),
            }
        }))
    }
}

/// Workers as `drover worker run <id>` child processes.
pub struct ProcessSpawner {
    exe: PathBuf,
    /// Flags passed after `worker run <id>`.
    args: Vec<String>,
    repo_dir: PathBuf,
    /// Each child's stdout/stderr go to `{log_dir}/worker-{n}.log`.
    log_dir: PathBuf,
    /// Time a child gets to write its terminal phase after SIGTERM.
    grace: Duration,
}

impl ProcessSpawner {
    pub fn new(
        exe: PathBuf,
        args: Vec<String>,
        repo_dir: PathBuf,
        log_dir: PathBuf,
        grace: Duration,
    ) -> Self {
        Self {
            exe,
            args,
            repo_dir,
            log_dir,
            grace,
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, issue: &Issue, cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        std::fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_dir.join(format!("worker-{}.log", issue.number));
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let mut child = tokio::process::Command::new(&self.exe)
            .args(["worker", "run", &issue.number.to_string()])
            .args(&self.args)
            .current_dir(&self.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn_with_context()?;
        let pid = child.id();
        let issue_id = issue.number;
        let grace = self.grace;
        tracing::info!(issue = issue_id, pid, log = %log_path.display(), "spawned worker process");

        Ok(tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(s) => tracing::info!(issue = issue_id, code = s.code(), "worker process exited"),
                    Err(e) => tracing::error!(issue = issue_id, ?e, "waiting for worker process"),
                },
                _ = cancel.cancelled() => {
                    if let Some(pid) = pid {
                        terminate(pid);
                    }
                    if tokio::time::timeout(grace, child.wait()).await.is_err() {
                        tracing::warn!(issue = issue_id, "worker ignored SIGTERM, killing");
                        let _ = child.kill().await;
                    }
                }
            }
        }))
    }
}

fn terminate(pid: u32) {
    let sent = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status_with_context();
    if let Err(e) = sent {
        tracing::warn!(pid, ?e, "could not signal worker process");
    }
}

pub struct PoolEntry {
    pub issue_id: u64,
    pub title: String,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PoolEntry {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct Pool {
    capacity: usize,
    entries: BTreeMap<u64, PoolEntry>,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shrinking never stops running workers; it only delays new ones.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.entries.len() < self.capacity
    }

    pub fn contains(&self, issue_id: u64) -> bool {
        self.entries.contains_key(&issue_id)
    }

    pub fn issue_ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn get(&self, issue_id: u64) -> Option<&PoolEntry> {
        self.entries.get(&issue_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PoolEntry> {
        self.entries.values()
    }

    /// Spawn a worker unless one is already running for the issue.
    pub fn start(&mut self, issue: &Issue, spawner: &dyn WorkerSpawner) -> anyhow::Result<()> {
        if self.contains(issue.number) {
            anyhow::bail!("a worker for #{} is already running", issue.number);
        }
        if !self.has_capacity() {
            anyhow::bail!("worker pool is full ({} running)", self.entries.len());
        }
        let cancel = CancellationToken::new();
        let handle = spawner.spawn(issue, cancel.clone())?;
        self.entries.insert(
            issue.number,
            PoolEntry {
                issue_id: issue.number,
                title: issue.title.clone(),
                started: Instant::now(),
                started_at: Utc::now(),
                cancel,
                handle,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, issue_id: u64) -> Option<PoolEntry> {
        self.entries.remove(&issue_id)
    }

    /// Running workers older than `limit` that have not been cancelled yet.
    pub fn overdue(&self, limit: Duration) -> Vec<u64> {
        self.entries
            .values()
            .filter(|e| !e.is_cancelled() && e.started.elapsed() > limit)
            .map(|e| e.issue_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Spawns tasks that run until cancelled.
    #[derive(Default)]
    struct Idle {
        spawned: AtomicUsize,
    }

    impl WorkerSpawner for Idle {
        fn spawn(&self, _: &Issue, cancel: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(tokio::spawn(async move { cancel.cancelled().await }))
        }
    }

    fn issue(n: u64) -> Issue {
        Issue {
            number: n,
            title: format!("issue {n}"),
            body: String::new(),
            labels: vec![],
            linked_pr: None,
            url: None,
        }
    }

    #[tokio::test]
    async fn refuses_second_worker_for_same_issue() {
        let spawner = Arc::new(Idle::default());
        let mut pool = Pool::new(3);
        pool.start(&issue(1), spawner.as_ref()).unwrap();
        assert!(pool.start(&issue(1), spawner.as_ref()).is_err());
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn respects_capacity() {
        let spawner = Idle::default();
        let mut pool = Pool::new(2);
        pool.start(&issue(1), &spawner).unwrap();
        pool.start(&issue(2), &spawner).unwrap();
        assert!(!pool.has_capacity());
        assert!(pool.start(&issue(3), &spawner).is_err());
        pool.set_capacity(3);
        pool.start(&issue(3), &spawner).unwrap();
        assert_eq!(pool.issue_ids(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_workers_are_reported_until_cancelled() {
        let spawner = Idle::default();
        let mut pool = Pool::new(2);
        pool.start(&issue(4), &spawner).unwrap();
        assert!(pool.overdue(Duration::from_secs(60)).is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.overdue(Duration::from_secs(60)), vec![4]);

        pool.get(4).unwrap().cancel();
        assert!(pool.overdue(Duration::from_secs(60)).is_empty());
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(pool.get(4).unwrap().is_finished());
    }
}
