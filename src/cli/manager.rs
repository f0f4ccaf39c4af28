use super::dashboard;
use super::PathArgs;
use crate::config::{ManagerSettings, WorkerMode, WorkerSettings};
use crate::engine::manager::pool::{InProcessSpawner, ProcessSpawner, WorkerSpawner};
use crate::engine::manager::{eligibility, Manager, ManagerDeps, ManagerStatus};
use crate::escalation::{BannerPolicy, EscalationHandler};
use crate::home::Paths;
use crate::host::with_retries;
use crate::triage;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Time a worker process gets to record `abandoned` after SIGTERM.
const PROCESS_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Repository in OWNER/REPO format (default: `repo` config key)
    pub repo: Option<String>,
    /// Redraw a status table after every tick
    #[arg(long)]
    pub dashboard: bool,
    /// Run a single scheduling round and exit
    #[arg(long)]
    pub once: bool,
    /// Maximum concurrent workers
    #[arg(long)]
    pub max_workers: Option<usize>,
    /// Only pick up issues carrying one of these labels
    #[arg(long, value_delimiter = ',')]
    pub auto_assign_labels: Vec<String>,
    /// Never pick up issues carrying one of these labels
    #[arg(long, value_delimiter = ',')]
    pub skip_labels: Vec<String>,
    /// Run workers in dry-run mode
    #[arg(long)]
    pub dry_run: bool,
    /// Run workers as in-process tasks or child processes
    #[arg(long, value_name = "task|process")]
    pub worker_mode: Option<String>,
    /// Local checkout to create worktrees from (default: current directory)
    #[arg(long)]
    pub repo_dir: Option<PathBuf>,
}

/// Command-line choices that win over config, re-applied on every reload.
#[derive(Debug, Clone, Default)]
struct Overrides {
    max_workers: Option<usize>,
    allow_labels: Vec<String>,
    deny_labels: Vec<String>,
    dry_run: bool,
    worker_mode: Option<WorkerMode>,
}

impl Overrides {
    fn apply(&self, mut settings: ManagerSettings) -> ManagerSettings {
        if let Some(n) = self.max_workers {
            settings.max_workers = n.max(1);
        }
        if !self.allow_labels.is_empty() {
            settings.allow_labels = self.allow_labels.clone();
        }
        if !self.deny_labels.is_empty() {
            settings.deny_labels = self.deny_labels.clone();
        }
        settings.dry_run |= self.dry_run;
        if let Some(mode) = self.worker_mode {
            settings.worker_mode = mode;
        }
        settings
    }
}

/// Run the manager loop until SIGINT/SIGTERM (or one tick with `--once`).
pub async fn run(args: RunArgs, path_args: &PathArgs) -> anyhow::Result<()> {
    let repo = super::resolve_repo(args.repo)?;
    let paths = path_args.resolve()?;
    paths.ensure()?;

    let overrides = Overrides {
        max_workers: args.max_workers,
        allow_labels: args.auto_assign_labels,
        deny_labels: args.skip_labels,
        dry_run: args.dry_run,
        worker_mode: args
            .worker_mode
            .as_deref()
            .map(|m| m.parse::<WorkerMode>())
            .transpose()?,
    };
    let settings = overrides.apply(ManagerSettings::load());

    let gateway = super::gateway(&repo, settings.dry_run)?;
    let sink = super::sink(&paths)?;
    let escalations = Arc::new(EscalationHandler::open(
        &paths.escalation_file,
        sink.clone(),
        BannerPolicy {
            on_block: settings.notify_on_block,
            on_main_failure: settings.notify_on_main_failure,
        },
    )?);
    let repo_dir = super::repo_dir(args.repo_dir).await?;

    let spawner: Arc<dyn WorkerSpawner> = match settings.worker_mode {
        WorkerMode::Task => {
            let mut worker_settings = WorkerSettings::load();
            worker_settings.dry_run |= settings.dry_run;
            let deps = super::worker_deps(
                &worker_settings,
                gateway.clone(),
                &repo_dir,
                &paths,
                sink.clone(),
            )
            .await?;
            Arc::new(InProcessSpawner::new(worker_settings, deps))
        }
        WorkerMode::Process => Arc::new(ProcessSpawner::new(
            std::env::current_exe().context("locating drover executable")?,
            child_args(&repo, settings.dry_run, &paths),
            repo_dir.clone(),
            paths.base_dir.join("logs"),
            PROCESS_GRACE,
        )),
    };

    let deps = ManagerDeps {
        gateway,
        store: super::store(&paths)?,
        sink: sink.clone(),
        escalations,
        spawner,
    };
    let dashboard_on = args.dashboard;
    let mut manager = Manager::new(
        repo,
        settings,
        deps,
        paths.manager_status_file(),
        sink.end_cursor(),
    );

    if args.once {
        let report = manager.tick().await?;
        match manager.status() {
            Some(status) if dashboard_on => dashboard::redraw(status),
            _ => println!(
                "spawned {:?}, finished {}, escalated {:?}, cancelled {:?}",
                report.spawned,
                report.finished.len(),
                report.escalated,
                report.cancelled
            ),
        }
        let running = manager.active_workers();
        if !running.is_empty() {
            tracing::info!(
                workers = ?running,
                "leaving unfinished workers; resume them with `drover worker run`"
            );
        }
        return Ok(());
    }

    manager
        .serve(
            CancellationToken::new(),
            move || overrides.apply(ManagerSettings::load()),
            move |status| {
                if dashboard_on {
                    dashboard::redraw(status);
                }
            },
        )
        .await
}

/// Flags a child `drover worker run <id>` needs to share this manager's
/// repository and filesystem layout.
fn child_args(repo: &str, dry_run: bool, paths: &Paths) -> Vec<String> {
    let mut args = vec!["--repo".to_string(), repo.to_string()];
    if dry_run {
        args.push("--dry-run".into());
    }
    for (flag, path) in [
        ("--base-dir", &paths.base_dir),
        ("--status-dir", &paths.status_dir),
        ("--worktree-dir", &paths.worktree_dir),
        ("--notification-file", &paths.notification_file),
        ("--escalation-file", &paths.escalation_file),
    ] {
        args.push(flag.to_string());
        args.push(path.display().to_string());
    }
    args
}

/// Print the last status the manager wrote.
pub async fn status(path_args: &PathArgs) -> anyhow::Result<()> {
    let paths = path_args.resolve()?;
    let file = paths.manager_status_file();
    match ManagerStatus::read(&file)? {
        Some(status) => print!("{}", dashboard::render(&status, chrono::Utc::now())),
        None => println!("No manager status at {} (has the manager run?)", file.display()),
    }
    Ok(())
}

/// Open issues carrying any of `labels`, with the complexity triage would
/// give them and whether the manager would pick them up.
pub async fn list_issues(repo: Option<String>, labels: Vec<String>) -> anyhow::Result<()> {
    let repo = super::resolve_repo(repo)?;
    let settings = ManagerSettings::load();
    let labels = if labels.is_empty() {
        settings.allow_labels.clone()
    } else {
        labels
    };
    let gateway = super::gateway(&repo, false)?;
    let issues = with_retries(3, Duration::from_secs(2), || {
        gateway.list_open_issues(&labels)
    })
    .await?;

    if issues.is_empty() {
        println!("No open issues labeled {}", labels.join(", "));
        return Ok(());
    }
    println!("{:<8} {:<8} {:<9} TITLE", "ISSUE", "TRIAGE", "ELIGIBLE");
    println!("{}", "-".repeat(70));
    for issue in &issues {
        let complexity = triage::classify(&issue.labels, &issue.title, &issue.body);
        let eligible = eligibility(issue, &labels, &settings.deny_labels).is_some();
        println!(
            "#{:<7} {:<8} {:<9} {}",
            issue.number,
            complexity.as_str(),
            if eligible { "yes" } else { "no" },
            issue.title
        );
    }
    Ok(())
}

/// Close an issue's escalations and archive its status document so the
/// manager may schedule it again.
pub async fn resolve(issue_id: u64, path_args: &PathArgs) -> anyhow::Result<()> {
    let paths = path_args.resolve()?;
    let handler = EscalationHandler::open(
        &paths.escalation_file,
        super::sink(&paths)?,
        BannerPolicy::default(),
    )?;
    let closed = handler.resolve(issue_id)?;
    let archived = super::store(&paths)?.archive(issue_id).await?;
    println!(
        "#{issue_id}: closed {closed} escalation(s){}",
        if archived {
            ", archived status document"
        } else {
            ""
        }
    );
    Ok(())
}
