pub mod dashboard;
pub mod manager;
pub mod worker;

use crate::channels::{JsonlNotificationSink, NotificationSink};
use crate::config::{self, WorkerSettings};
use crate::engine::worker::git_ops::GitVcs;
use crate::engine::worker::oracle::ClaudeOracle;
use crate::engine::worker::validate::CommandValidator;
use crate::engine::worker::worktree::{resolve_main_repo, GitWorktrees};
use crate::engine::worker::WorkerDeps;
use crate::github::http::GhHttp;
use crate::home::{PathOverrides, Paths};
use crate::host::{with_retries, DryRunGateway, GitHubGateway, HostGateway};
use crate::status::{FsStatusStore, StatusStore};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Filesystem layout flags shared by every subcommand.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct PathArgs {
    /// Base directory for status, worktrees and logs (default: ~/.drover)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,
    /// Directory holding worker status documents
    #[arg(long, global = true)]
    pub status_dir: Option<PathBuf>,
    /// Directory holding per-issue worktrees
    #[arg(long, global = true)]
    pub worktree_dir: Option<PathBuf>,
    /// Notification log (JSON lines)
    #[arg(long, global = true)]
    pub notification_file: Option<PathBuf>,
    /// Escalation log (JSON lines)
    #[arg(long, global = true)]
    pub escalation_file: Option<PathBuf>,
}

impl PathArgs {
    pub fn resolve(&self) -> anyhow::Result<Paths> {
        Paths::resolve(&PathOverrides {
            base_dir: self.base_dir.clone(),
            status_dir: self.status_dir.clone(),
            worktree_dir: self.worktree_dir.clone(),
            notification_file: self.notification_file.clone(),
            escalation_file: self.escalation_file.clone(),
        })
    }
}

/// Print version information.
pub fn version() {
    println!("drover {}", env!("CARGO_PKG_VERSION"));
}

/// `--repo` flag, else the `repo` config key.
fn resolve_repo(flag: Option<String>) -> anyhow::Result<String> {
    let repo = flag
        .or_else(config::repo)
        .context("no repository given: pass OWNER/REPO or set `repo` in .drover.yml")?;
    if !repo.contains('/') {
        anyhow::bail!("repository must be OWNER/REPO, got {repo:?}");
    }
    Ok(repo)
}

/// GitHub gateway, wrapped so nothing is mutated in dry-run mode.
fn gateway(repo: &str, dry_run: bool) -> anyhow::Result<Arc<dyn HostGateway>> {
    let http = GhHttp::new(config::github_token()?)?;
    let live: Arc<dyn HostGateway> = Arc::new(GitHubGateway::new(http, repo));
    Ok(if dry_run {
        Arc::new(DryRunGateway::new(live))
    } else {
        live
    })
}

fn store(paths: &Paths) -> anyhow::Result<Arc<dyn StatusStore>> {
    Ok(Arc::new(FsStatusStore::new(&paths.status_dir)?))
}

fn sink(paths: &Paths) -> anyhow::Result<Arc<JsonlNotificationSink>> {
    Ok(Arc::new(JsonlNotificationSink::new(&paths.notification_file)?))
}

/// The checkout worktrees branch from: `--repo-dir` or the current
/// directory, followed back to the main repository.
async fn repo_dir(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = match flag {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    if !dir.is_dir() {
        anyhow::bail!("repository directory {} does not exist", dir.display());
    }
    Ok(resolve_main_repo(&dir).await)
}

/// Production seams for a worker.
async fn worker_deps(
    settings: &WorkerSettings,
    gateway: Arc<dyn HostGateway>,
    repo_dir: &Path,
    paths: &Paths,
    sink: Arc<dyn NotificationSink>,
) -> anyhow::Result<WorkerDeps> {
    let default_branch = with_retries(settings.max_retries, Duration::from_secs(2), || {
        gateway.default_branch()
    })
    .await
    .context("reading default branch")?;

    Ok(WorkerDeps {
        oracle: Arc::new(ClaudeOracle::new(settings.oracle.clone())),
        isolation: Arc::new(GitWorktrees::new(
            repo_dir,
            &paths.worktree_dir,
            default_branch,
        )),
        vcs: Arc::new(GitVcs::new(settings.dry_run)),
        validator: Arc::new(CommandValidator::new(
            settings.validate_timeout,
            settings.coverage_threshold,
        )),
        store: store(paths)?,
        gateway,
        sink,
    })
}
