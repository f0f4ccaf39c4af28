//! Per-issue git worktrees.
//!
//! Each worker gets `{worktree_dir}/issue-{n}` on branch `worker/issue-{n}`.
//! Ownership is a lease file `{worktree_dir}/.leases/issue-{n}.json`
//! holding the owner's pid and token:
//!
//! - no lease, or the leaseholder is gone: take it (reuse the directory if
//!   it survived a crash)
//! - lease held by a live holder under another token: [`IsolationError::Busy`]
//!
//! A holder in another process is live while its pid is. A holder in this
//! process (task mode) is live while its [`OwnerGuard`] exists, so a worker
//! task that panicked does not keep its issue busy. Reclaiming a stale lease
//! happens under a `.claim` file so two reclaimers cannot both win.
//!
//! Release removes the worktree and the lease and never fails.

use super::branch_name;
use crate::cmd::{CommandErrorContext, SyncCommandErrorContext};
use crate::status::{read_json, write_json_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use tokio::process::Command;

/// Lease owners held by workers running in this process.
static LIVE_OWNERS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Marks a lease owner token as gone when dropped. A worker holds one for
/// its whole life, including when its task unwinds.
#[derive(Debug)]
pub struct OwnerGuard(String);

impl OwnerGuard {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        forget_owner(&self.0);
    }
}

fn register_owner(owner: &str) {
    if let Ok(mut live) = LIVE_OWNERS.lock() {
        live.insert(owner.to_string());
    }
}

fn forget_owner(owner: &str) {
    if let Ok(mut live) = LIVE_OWNERS.lock() {
        live.remove(owner);
    }
}

fn owner_registered(owner: &str) -> bool {
    LIVE_OWNERS
        .lock()
        .map(|live| live.contains(owner))
        .unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("issue #{issue} is owned by live process {pid}")]
    Busy { issue: u64, pid: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("git: {0}")]
    Git(String),
}

/// An acquired worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub issue_id: u64,
    pub path: PathBuf,
    pub branch: String,
    /// Ref the branch is compared against, e.g. `origin/main`.
    pub base: String,
}

#[async_trait]
pub trait Isolation: Send + Sync {
    async fn acquire(&self, issue_id: u64, owner: &str) -> Result<Worktree, IsolationError>;

    async fn release(&self, worktree: &Worktree, owner: &str);
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Lease {
    pid: u32,
    owner: String,
    acquired_at: DateTime<Utc>,
}

pub struct GitWorktrees {
    repo_dir: PathBuf,
    worktree_dir: PathBuf,
    default_branch: String,
}

impl GitWorktrees {
    pub fn new(
        repo_dir: impl Into<PathBuf>,
        worktree_dir: impl Into<PathBuf>,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            worktree_dir: worktree_dir.into(),
            default_branch: default_branch.into(),
        }
    }

    pub fn path_for(&self, issue_id: u64) -> PathBuf {
        self.worktree_dir.join(format!("issue-{issue_id}"))
    }

    fn lease_path(&self, issue_id: u64) -> PathBuf {
        self.worktree_dir
            .join(".leases")
            .join(format!("issue-{issue_id}.json"))
    }

    fn claim_path(&self, issue_id: u64) -> PathBuf {
        self.worktree_dir
            .join(".leases")
            .join(format!("issue-{issue_id}.claim"))
    }

    fn take_lease(&self, issue_id: u64, owner: &str) -> Result<(), IsolationError> {
        let path = self.lease_path(issue_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lease = Lease {
            pid: std::process::id(),
            owner: owner.to_string(),
            acquired_at: Utc::now(),
        };

        if create_exclusive(&path, &lease)? {
            register_owner(owner);
            return Ok(());
        }

        let held: Option<Lease> = read_json(&path).unwrap_or_else(|e| {
            tracing::warn!(issue = issue_id, ?e, "unreadable lease, reclaiming");
            None
        });
        match held {
            Some(held) if held.owner == owner => {
                write_json_atomic(&path, &lease).map_err(|e| std::io::Error::other(format!("{e:#}")))?;
            }
            Some(held) if holder_alive(&held) => {
                return Err(IsolationError::Busy {
                    issue: issue_id,
                    pid: held.pid,
                })
            }
            _ => self.reclaim(issue_id, &lease)?,
        }
        register_owner(owner);
        Ok(())
    }

    /// Replace a stale lease. The claim file serialises reclaimers; the
    /// lease is re-checked once the claim is held.
    fn reclaim(&self, issue_id: u64, lease: &Lease) -> Result<(), IsolationError> {
        let claim = self.claim_path(issue_id);
        if !create_exclusive(&claim, lease)? {
            let claimant: Option<Lease> = read_json(&claim).unwrap_or(None);
            match claimant {
                Some(c) if pid_alive(c.pid) => {
                    return Err(IsolationError::Busy {
                        issue: issue_id,
                        pid: c.pid,
                    })
                }
                _ => {
                    tracing::warn!(issue = issue_id, "removing abandoned lease claim");
                    remove_if_exists(&claim)?;
                    if !create_exclusive(&claim, lease)? {
                        return Err(IsolationError::Busy {
                            issue: issue_id,
                            pid: 0,
                        });
                    }
                }
            }
        }

        let path = self.lease_path(issue_id);
        let result = match read_json::<Lease>(&path).unwrap_or(None) {
            Some(held) if held.owner != lease.owner && holder_alive(&held) => {
                Err(IsolationError::Busy {
                    issue: issue_id,
                    pid: held.pid,
                })
            }
            held => {
                if let Some(stale) = held {
                    tracing::warn!(
                        issue = issue_id,
                        stale_pid = stale.pid,
                        stale_owner = %stale.owner,
                        "reclaiming stale lease"
                    );
                }
                write_json_atomic(&path, lease)
                    .map_err(|e| IsolationError::Io(std::io::Error::other(format!("{e:#}"))))
            }
        };
        remove_if_exists(&claim)?;
        result
    }

    /// `origin/{default}` when the remote ref exists, else the local branch.
    async fn base_ref(&self) -> String {
        let remote = format!("origin/{}", self.default_branch);
        let known = git(&self.repo_dir, &["rev-parse", "--verify", "--quiet", &remote])
            .await
            .is_ok();
        if known {
            remote
        } else {
            self.default_branch.clone()
        }
    }

    async fn create(&self, path: &Path, branch: &str, base: &str) -> Result<(), IsolationError> {
        let repo = &self.repo_dir;
        if base.starts_with("origin/") {
            if let Err(e) = git(repo, &["fetch", "origin", &self.default_branch]).await {
                tracing::warn!(err = %e, "fetch failed, using cached remote ref");
            }
        }
        let branch_ref = format!("refs/heads/{branch}");
        let branch_exists = git(repo, &["rev-parse", "--verify", "--quiet", &branch_ref])
            .await
            .is_ok();
        let path_str = path.to_string_lossy().to_string();
        let add: Vec<&str> = if branch_exists {
            vec!["worktree", "add", &path_str, branch]
        } else {
            vec!["worktree", "add", "-b", branch, &path_str, base]
        };

        if let Err(first) = git(repo, &add).await {
            tracing::warn!(err = %first, "worktree creation failed, retrying after prune");
            let _ = git(repo, &["worktree", "prune"]).await;
            git(repo, &add).await.map_err(IsolationError::Git)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Isolation for GitWorktrees {
    async fn acquire(&self, issue_id: u64, owner: &str) -> Result<Worktree, IsolationError> {
        self.take_lease(issue_id, owner)?;

        let path = self.path_for(issue_id);
        let branch = branch_name(issue_id);
        let base = self.base_ref().await;

        if path.join(".git").exists() {
            tracing::info!(issue = issue_id, worktree = %path.display(), "reusing worktree");
        } else {
            if path.exists() {
                // leftover directory without git metadata
                std::fs::remove_dir_all(&path)?;
            }
            std::fs::create_dir_all(&self.worktree_dir)?;
            tracing::info!(issue = issue_id, worktree = %path.display(), %branch, "creating worktree");
            self.create(&path, &branch, &base).await?;
        }

        Ok(Worktree {
            issue_id,
            path,
            branch,
            base,
        })
    }

    async fn release(&self, worktree: &Worktree, owner: &str) {
        let path_str = worktree.path.to_string_lossy().to_string();
        if let Err(e) = git(&self.repo_dir, &["worktree", "remove", "--force", &path_str]).await {
            tracing::debug!(err = %e, "git worktree remove failed");
        }
        if worktree.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&worktree.path) {
                tracing::warn!(worktree = %worktree.path.display(), ?e, "could not remove worktree");
            }
        }
        let _ = git(&self.repo_dir, &["worktree", "prune"]).await;

        let lease_path = self.lease_path(worktree.issue_id);
        let ours = matches!(
            read_json::<Lease>(&lease_path),
            Ok(Some(lease)) if lease.owner == owner
        );
        if ours {
            if let Err(e) = std::fs::remove_file(&lease_path) {
                tracing::warn!(lease = %lease_path.display(), ?e, "could not remove lease");
            }
        }
        forget_owner(owner);
        tracing::info!(issue = worktree.issue_id, "released worktree");
    }
}

/// The main checkout for `dir`, so worktrees are never nested inside
/// another worktree.
pub async fn resolve_main_repo(dir: &Path) -> PathBuf {
    if let Ok(listing) = git(dir, &["worktree", "list", "--porcelain"]).await {
        if let Some(main) = listing
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("worktree "))
        {
            let main = PathBuf::from(main);
            if main != dir {
                tracing::info!(dir = %dir.display(), main = %main.display(), "resolved to main repository");
            }
            return main;
        }
    }
    dir.to_path_buf()
}

/// Write `value` to `path` only if the file does not exist yet.
fn create_exclusive<T: Serialize>(path: &Path, value: &T) -> Result<bool, IsolationError> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            let json = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
            file.write_all(&json)?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Holders in this process are judged by their owner token, others by pid.
fn holder_alive(lease: &Lease) -> bool {
    if lease.pid == std::process::id() {
        return owner_registered(&lease.owner);
    }
    pid_alive(lease.pid)
}

fn pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status_with_context()
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn git(dir: &Path, args: &[&str]) -> Result<String, String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output_with_context()
        .await
        .map_err(|e| format!("{e:#}"))?;
    if out.status.success() {
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    } else {
        Err(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ))
    }
}
