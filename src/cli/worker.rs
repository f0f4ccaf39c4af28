use super::dashboard;
use super::PathArgs;
use crate::config::WorkerSettings;
use crate::engine::worker::Worker;
use crate::status::{WorkerPhase, WorkerStatus};
use chrono::Utc;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Issue number to work on
    pub issue_id: u64,
    /// Repository in OWNER/REPO format (default: `repo` config key)
    #[arg(long)]
    pub repo: Option<String>,
    /// Simulate every host mutation and skip pushes
    #[arg(long)]
    pub dry_run: bool,
    /// Squash-merge without waiting for a maintainer
    #[arg(long)]
    pub auto_merge: bool,
    /// Minimum coverage percentage for Python projects
    #[arg(long)]
    pub coverage_threshold: Option<u32>,
    /// Local checkout to create worktrees from (default: current directory)
    #[arg(long)]
    pub repo_dir: Option<PathBuf>,
}

/// Run one worker to a terminal phase and return that phase.
pub async fn run(args: RunArgs, paths: &PathArgs) -> anyhow::Result<WorkerPhase> {
    let repo = super::resolve_repo(args.repo)?;
    let paths = paths.resolve()?;
    paths.ensure()?;

    let mut settings = WorkerSettings::load();
    settings.dry_run |= args.dry_run;
    settings.auto_merge |= args.auto_merge;
    if args.coverage_threshold.is_some() {
        settings.coverage_threshold = args.coverage_threshold;
    }

    let gateway = super::gateway(&repo, settings.dry_run)?;
    let repo_dir = super::repo_dir(args.repo_dir).await?;
    let sink = super::sink(&paths)?;
    let deps = super::worker_deps(&settings, gateway, &repo_dir, &paths, sink).await?;

    tracing::info!(
        issue = args.issue_id,
        repo = %repo,
        repo_dir = %repo_dir.display(),
        dry_run = settings.dry_run,
        "starting worker"
    );

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let status = Worker::new(args.issue_id, settings, deps).run(cancel).await?;
    print_summary(&status);
    Ok(status.phase)
}

/// SIGINT/SIGTERM cancel the worker so it can record `abandoned` itself.
fn cancel_on_signal(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, abandoning"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, abandoning"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
    Ok(())
}

/// Show one worker's status document.
pub async fn status(issue_id: u64, json: bool, paths: &PathArgs) -> anyhow::Result<()> {
    let paths = paths.resolve()?;
    let store = super::store(&paths)?;
    let Some(status) = store.read(issue_id).await? else {
        anyhow::bail!(
            "no status document for #{issue_id} in {}",
            paths.status_dir.display()
        );
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_summary(&status);
    if let Some(branch) = &status.branch {
        println!("  branch:    {branch}");
    }
    if let Some(path) = &status.worktree_path {
        println!("  worktree:  {}", path.display());
    }
    if let Some(ci) = status.ci_status {
        println!(
            "  ci:        {ci} ({} fix attempts)",
            status.ci_fix_attempts
        );
    }
    if !status.created_issues.is_empty() {
        let list: Vec<String> = status.created_issues.iter().map(|n| format!("#{n}")).collect();
        println!("  follow-ups: {}", list.join(", "));
    }
    println!();
    println!("Recent log:");
    let skip = status.logs.len().saturating_sub(15);
    for entry in &status.logs[skip..] {
        println!(
            "  {} {:<5} {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.level.as_str(),
            entry.message
        );
    }
    Ok(())
}

/// One line per status document.
pub async fn list(paths: &PathArgs) -> anyhow::Result<()> {
    let paths = paths.resolve()?;
    let docs = super::store(&paths)?.list().await?;
    if docs.is_empty() {
        println!("No workers in {}", paths.status_dir.display());
        return Ok(());
    }
    println!("{:<8} {:<18} {:<7} LAST", "ISSUE", "PHASE", "AGE");
    println!("{}", "-".repeat(60));
    let now = Utc::now();
    for doc in &docs {
        println!("{}", dashboard::worker_row(doc, now));
    }
    Ok(())
}

fn print_summary(status: &WorkerStatus) {
    let dry = if status.dry_run { " [dry-run]" } else { "" };
    println!("#{} {}{dry}", status.issue_id, status.title);
    println!("  phase:     {}", status.phase);
    if let Some(reason) = &status.reason {
        println!("  reason:    {reason}");
    }
    println!("  commits:   {}", status.commits.len());
    if let Some(pr) = &status.pr {
        match &pr.url {
            Some(url) => println!("  pr:        #{} {url}", pr.number),
            None => println!("  pr:        #{}", pr.number),
        }
    }
    if let Some(sha) = &status.merge_commit {
        let verified = if status.main_branch_verified {
            "verified"
        } else {
            "unverified"
        };
        println!("  merged:    {sha} ({verified})");
    }
}
