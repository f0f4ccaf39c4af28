//! The worker: drives one issue from implementation to a verified merge.
//!
//! ```text
//! INITIALIZE → IMPLEMENT → VALIDATE → CREATE_PR → REVIEW_LOOP → CI_LOOP → MERGE → VERIFY_MAIN
//!                                                                                     │
//!                                  COMPLETED | BLOCKED | FAILED | MAIN_BRANCH_FAILED ◄─┘
//! ```
//!
//! Every transition is written to the status document before the next
//! phase starts, so a restarted worker picks up where the last one stopped.
//! All side effects go through the seams in [`WorkerDeps`]; the state
//! machine itself never touches git, the network or the filesystem.
//!
//! Cancellation is first-class: when the token fires, whatever phase is in
//! flight is dropped, the terminal `abandoned` phase is written by this
//! worker (the only writer of its document) and the worktree is released.

pub mod git_ops;
pub mod oracle;
pub mod poll;
pub mod review;
pub mod validate;
pub mod worktree;

use self::git_ops::{RebaseOutcome, Vcs};
use self::oracle::{ImplementationOracle, OracleError, OracleOutcome, OracleRequest};
use self::poll::Poller;
use self::review::CommentClass;
use self::validate::Validator;
use self::worktree::{Isolation, IsolationError, OwnerGuard, Worktree};
use crate::channels::{NotificationEvent, NotificationKind, NotificationSink};
use crate::config::WorkerSettings;
use crate::host::{
    with_retries, CiStatus, HostError, HostGateway, Issue, Mergeability, NewPullRequest,
    ReviewDecision,
};
use crate::redact::redact_tail;
use crate::status::{LogLevel, PrRef, StatusStore, WorkerPhase, WorkerStatus};
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const BRANCH_PREFIX: &str = "worker/issue-";

/// First delay between retried host calls; doubles per attempt.
const HOST_RETRY_DELAY: Duration = Duration::from_secs(2);

/// CI log characters handed to the oracle.
const MAX_CI_LOG: usize = 6000;

pub fn branch_name(issue_id: u64) -> String {
    format!("{BRANCH_PREFIX}{issue_id}")
}

/// The seams a worker acts through.
#[derive(Clone)]
pub struct WorkerDeps {
    pub gateway: Arc<dyn HostGateway>,
    pub oracle: Arc<dyn ImplementationOracle>,
    pub isolation: Arc<dyn Isolation>,
    pub vcs: Arc<dyn Vcs>,
    pub validator: Arc<dyn Validator>,
    pub store: Arc<dyn StatusStore>,
    pub sink: Arc<dyn NotificationSink>,
}

enum Transition {
    To(WorkerPhase),
    Finish(WorkerPhase, String),
}

pub struct Worker {
    issue_id: u64,
    settings: WorkerSettings,
    deps: WorkerDeps,
    /// Lease token, unique per worker instance.
    owner: String,
    /// Keeps `owner` live for in-process lease checks until this worker is gone.
    _owner_guard: OwnerGuard,
    status: WorkerStatus,
    issue: Option<Issue>,
    worktree: Option<Worktree>,
    /// Latest oracle summary, used in the PR body.
    summary: String,
}

impl Worker {
    pub fn new(issue_id: u64, settings: WorkerSettings, deps: WorkerDeps) -> Self {
        let nonce = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let owner = format!("{}-{issue_id}-{nonce}", std::process::id());
        Self {
            issue_id,
            _owner_guard: OwnerGuard::new(owner.clone()),
            owner,
            status: WorkerStatus::new(issue_id, settings.dry_run),
            settings,
            deps,
            issue: None,
            worktree: None,
            summary: String::new(),
        }
    }

    /// Run to a terminal phase (or until `cancel` fires) and return the
    /// final document. A document that is already terminal is returned
    /// untouched; an issue owned by another live worker is an error and
    /// nothing is written.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<WorkerStatus> {
        if let Some(existing) = self.deps.store.read(self.issue_id).await? {
            if existing.phase.is_terminal() {
                tracing::info!(issue = self.issue_id, phase = %existing.phase, "already finished");
                return Ok(existing);
            }
            tracing::info!(issue = self.issue_id, phase = %existing.phase, "resuming worker");
            self.status = existing;
            self.status.dry_run = self.settings.dry_run;
        }

        let worktree = match self.deps.isolation.acquire(self.issue_id, &self.owner).await {
            Ok(tree) => tree,
            Err(e @ IsolationError::Busy { .. }) => return Err(e.into()),
            Err(e) => {
                self.finish(WorkerPhase::Failed, format!("could not acquire worktree: {e}"))
                    .await?;
                return Ok(self.status);
            }
        };
        self.status.pid = std::process::id();
        self.status.branch = Some(worktree.branch.clone());
        self.status.worktree_path = Some(worktree.path.clone());
        self.worktree = Some(worktree);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.drive() => Some(result),
        };

        match outcome {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::error!(issue = self.issue_id, err = %format!("{e:#}"), "worker aborted");
                self.release().await;
                return Err(e);
            }
            None if self.status.phase.is_terminal() => self.release().await,
            None => {
                let phase = self.status.phase;
                self.finish(
                    WorkerPhase::Abandoned,
                    format!("cancelled during {phase} before reaching a terminal phase"),
                )
                .await?;
            }
        }
        Ok(self.status)
    }

    async fn drive(&mut self) -> anyhow::Result<()> {
        self.persist().await?;
        loop {
            let phase = self.status.phase;
            let step = match phase {
                WorkerPhase::Initialize => self.initialize().await,
                WorkerPhase::Implement => self.implement().await,
                WorkerPhase::Validate => self.validate().await,
                WorkerPhase::CreatePr => self.create_pr().await,
                WorkerPhase::ReviewLoop => self.review_loop().await,
                WorkerPhase::CiLoop => self.ci_loop().await,
                WorkerPhase::Merge => self.merge().await,
                WorkerPhase::VerifyMain => self.verify_main().await,
                _ => return Ok(()),
            };
            match step {
                Ok(Transition::To(next)) => self.transition(next).await?,
                Ok(Transition::Finish(terminal, reason)) => self.finish(terminal, reason).await?,
                Err(e) => {
                    self.finish(WorkerPhase::Failed, format!("{phase}: {e:#}"))
                        .await?
                }
            }
        }
    }

    // --- phases ---

    async fn initialize(&mut self) -> anyhow::Result<Transition> {
        let issue = self.issue().await?;
        let tree = self.tree()?;
        self.log(
            LogLevel::Info,
            format!(
                "working on #{} \"{}\" in {} (branch {}, base {})",
                issue.number,
                issue.title,
                tree.path.display(),
                tree.branch,
                tree.base
            ),
        );
        Ok(Transition::To(WorkerPhase::Implement))
    }

    async fn implement(&mut self) -> anyhow::Result<Transition> {
        let tree = self.tree()?;
        let existing = self.deps.vcs.commits_since(&tree.path, &tree.base).await?;
        if !existing.is_empty() {
            self.status.add_commits(existing);
            self.log(LogLevel::Info, "branch already has commits, moving on to validation");
            return Ok(Transition::To(WorkerPhase::Validate));
        }

        let issue = self.issue().await?;
        let budget = self.settings.implement_attempts;
        while self.status.oracle_attempts < budget {
            self.status.oracle_attempts += 1;
            let attempt = self.status.oracle_attempts;
            self.log(LogLevel::Info, format!("implementation attempt {attempt}/{budget}"));
            self.persist().await?;

            let request = OracleRequest::implement(&issue, &tree.path);
            let message = format!("Implement #{}: {}", issue.number, issue.title.trim());
            match self.oracle_step(&request, &message).await? {
                Ok(_) => {}
                Err(OracleError::Unavailable(msg)) => {
                    return Ok(Transition::Finish(
                        WorkerPhase::Failed,
                        format!("oracle unavailable: {msg}"),
                    ))
                }
                Err(e) => self.log(LogLevel::Warn, format!("attempt {attempt} failed: {e}")),
            }

            if !self.status.commits.is_empty() {
                return Ok(Transition::To(WorkerPhase::Validate));
            }
            self.log(LogLevel::Warn, format!("attempt {attempt} produced no commits"));
        }
        Ok(Transition::Finish(
            WorkerPhase::Failed,
            format!("no commits after {budget} implementation attempts"),
        ))
    }

    async fn validate(&mut self) -> anyhow::Result<Transition> {
        let tree = self.tree()?;
        let issue = self.issue().await?;
        let budget = self.settings.implement_attempts;
        loop {
            let report = self.deps.validator.validate(&tree.path).await?;
            if report.passed() {
                match report.project {
                    Some(kind) => self.log(LogLevel::Info, format!("validation passed ({kind:?})")),
                    None => self.log(
                        LogLevel::Warn,
                        "no recognised project type, validation skipped",
                    ),
                }
                return Ok(Transition::To(WorkerPhase::CreatePr));
            }

            let failed = report.failed_names().join(", ");
            if self.status.oracle_attempts >= budget {
                return Ok(Transition::Finish(
                    WorkerPhase::Failed,
                    format!("validation failed ({failed}) after {budget} oracle attempts"),
                ));
            }
            self.status.oracle_attempts += 1;
            let attempt = self.status.oracle_attempts;
            self.log(
                LogLevel::Warn,
                format!("validation failed ({failed}), fix attempt {attempt}/{budget}"),
            );
            self.persist().await?;

            let request = OracleRequest::fix_validation(&issue, &tree.path, &report.failure_summary());
            let message = format!("Fix validation for #{}", issue.number);
            match self.oracle_step(&request, &message).await? {
                Ok(_) => {}
                Err(OracleError::Unavailable(msg)) => {
                    return Ok(Transition::Finish(
                        WorkerPhase::Failed,
                        format!("oracle unavailable: {msg}"),
                    ))
                }
                Err(e) => self.log(LogLevel::Warn, format!("fix attempt {attempt} failed: {e}")),
            }
        }
    }

    async fn create_pr(&mut self) -> anyhow::Result<Transition> {
        let tree = self.tree()?;
        let issue = self.issue().await?;
        self.deps.vcs.push(&tree.path, &tree.branch, false).await?;

        let gw = self.deps.gateway.clone();
        let retries = self.settings.max_retries;
        let base = with_retries(retries, HOST_RETRY_DELAY, || gw.default_branch())
            .await
            .context("resolving default branch")?;
        let request = NewPullRequest {
            head: tree.branch.clone(),
            base,
            title: pr_title(&issue),
            body: self.pr_body(&issue),
        };
        let pr = match with_retries(retries, HOST_RETRY_DELAY, || gw.find_or_create_pr(&request)).await {
            Ok(pr) => pr,
            Err(e) => {
                return Ok(Transition::Finish(
                    WorkerPhase::Failed,
                    format!("could not open pull request: {e}"),
                ))
            }
        };

        match self.status.pr.as_mut() {
            Some(existing) if existing.number == pr.number => existing.url = pr.url.clone(),
            _ => {
                self.status.pr = Some(PrRef {
                    number: pr.number,
                    head_branch: pr.head_branch.clone(),
                    url: pr.url.clone(),
                    processed_comment_ids: Default::default(),
                    opened_at: Utc::now(),
                })
            }
        }
        self.log(LogLevel::Info, format!("pull request #{} open", pr.number));
        Ok(Transition::To(WorkerPhase::ReviewLoop))
    }

    async fn review_loop(&mut self) -> anyhow::Result<Transition> {
        let pr = self.pr()?;
        let tree = self.tree()?;
        let issue = self.issue().await?;
        let gw = self.deps.gateway.clone();
        let retries = self.settings.max_retries;
        let budget = self.settings.implement_attempts;
        let mut poller = Poller::new(self.settings.review_timeout, self.settings.review_poll);
        let mut failed_fixes = 0;
        // Blocking comments whose fix has not landed yet.
        let mut outstanding = 0;

        loop {
            let comments = match with_retries(retries, HOST_RETRY_DELAY, || {
                gw.list_review_comments(pr.number, Some(pr.opened_at))
            })
            .await
            {
                Ok(comments) => comments,
                Err(e) if e.is_retryable() => {
                    self.log(LogLevel::Warn, format!("could not list review comments: {e}"));
                    Vec::new()
                }
                Err(e) => return Err(e).context("listing review comments"),
            };

            let fresh: Vec<_> = comments
                .into_iter()
                .filter(|c| review::is_actionable(c) && !self.status.is_processed(c.id))
                .collect();
            let (blocking, deferred): (Vec<_>, Vec<_>) = fresh
                .into_iter()
                .partition(|c| review::classify(c) == CommentClass::Blocking);

            for comment in &deferred {
                let follow_up = review::follow_up_issue(pr.number, self.issue_id, comment);
                match with_retries(retries, HOST_RETRY_DELAY, || gw.create_issue(&follow_up)).await {
                    Ok(number) => {
                        self.status.created_issues.push(number);
                        self.mark_processed(comment.id);
                        self.log(
                            LogLevel::Info,
                            format!("opened follow-up #{number} for review comment {}", comment.id),
                        );
                        self.persist().await?;
                    }
                    Err(e) => self.log(
                        LogLevel::Warn,
                        format!("could not open follow-up for comment {}: {e}", comment.id),
                    ),
                }
            }

            if !blocking.is_empty() {
                self.log(
                    LogLevel::Info,
                    format!("addressing {} blocking review comment(s)", blocking.len()),
                );
                let request = OracleRequest::address_review(
                    &issue,
                    &tree.path,
                    &review::render_for_prompt(&blocking),
                );
                let message = format!("Address review feedback on #{}", pr.number);
                let before = self.status.commits.len();
                let failure = match self.oracle_step(&request, &message).await? {
                    Ok(_) if self.status.commits.len() > before => {
                        self.deps.vcs.push(&tree.path, &tree.branch, false).await?;
                        for comment in &blocking {
                            self.mark_processed(comment.id);
                        }
                        self.persist().await?;
                        None
                    }
                    Ok(_) => Some("the fix produced no commits".to_string()),
                    Err(OracleError::Unavailable(msg)) => {
                        return Ok(Transition::Finish(
                            WorkerPhase::Failed,
                            format!("oracle unavailable: {msg}"),
                        ))
                    }
                    Err(e) => Some(e.to_string()),
                };
                if let Some(why) = failure {
                    failed_fixes += 1;
                    if failed_fixes >= budget {
                        return Ok(Transition::Finish(
                            WorkerPhase::Blocked,
                            format!(
                                "could not address {} blocking review comment(s) on PR #{} \
                                 after {failed_fixes} attempts: {why}",
                                blocking.len(),
                                pr.number
                            ),
                        ));
                    }
                    self.log(
                        LogLevel::Warn,
                        format!("review fix attempt {failed_fixes}/{budget} failed, will retry: {why}"),
                    );
                    outstanding = blocking.len();
                } else {
                    outstanding = 0;
                }
            }

            let decision = match with_retries(retries, HOST_RETRY_DELAY, || {
                gw.review_decision(pr.number)
            })
            .await
            {
                Ok(decision) => decision,
                Err(e) => {
                    self.log(LogLevel::Warn, format!("could not read review decision: {e}"));
                    ReviewDecision::Pending
                }
            };
            if outstanding == 0 && decision == ReviewDecision::Approved {
                self.log(LogLevel::Info, format!("PR #{} approved", pr.number));
                return Ok(Transition::To(WorkerPhase::CiLoop));
            }

            if !poller.wait().await {
                let window = self.settings.review_timeout.as_secs();
                if outstanding > 0 {
                    return Ok(Transition::Finish(
                        WorkerPhase::Blocked,
                        format!(
                            "{outstanding} blocking review comment(s) on PR #{} still unaddressed \
                             after {window}s",
                            pr.number
                        ),
                    ));
                }
                if decision == ReviewDecision::ChangesRequested {
                    return Ok(Transition::Finish(
                        WorkerPhase::Blocked,
                        format!(
                            "changes requested on PR #{} and not re-reviewed within {window}s",
                            pr.number
                        ),
                    ));
                }
                self.log(
                    LogLevel::Info,
                    format!("review window of {window}s elapsed, proceeding"),
                );
                return Ok(Transition::To(WorkerPhase::CiLoop));
            }
        }
    }

    async fn ci_loop(&mut self) -> anyhow::Result<Transition> {
        Ok(self
            .await_green()
            .await?
            .unwrap_or(Transition::To(WorkerPhase::Merge)))
    }

    /// Wait for CI on the PR, fixing failures up to `ci_max_fixes` times.
    /// `None` means green (or no CI); otherwise the terminal transition.
    ///
    /// "No checks" only counts as passing for a PR that never had any. Once
    /// checks have run on it, or after a push from here, an empty check list
    /// means the new head has not been picked up yet.
    async fn await_green(&mut self) -> anyhow::Result<Option<Transition>> {
        let pr = self.pr()?.number;
        let tree = self.tree()?;
        let issue = self.issue().await?;
        let gw = self.deps.gateway.clone();
        let retries = self.settings.max_retries;
        let max_fixes = self.settings.ci_max_fixes;
        let mut poller = Poller::new(self.settings.ci_timeout, self.settings.ci_poll);
        let mut checks_seen = matches!(
            self.status.ci_status,
            Some(CiStatus::Pending | CiStatus::Failure | CiStatus::Success)
        );

        loop {
            let status = match with_retries(retries, HOST_RETRY_DELAY, || gw.ci_status(pr)).await {
                Ok(status) => status,
                Err(e) if e.is_retryable() => {
                    self.log(LogLevel::Warn, format!("could not read CI status: {e}"));
                    CiStatus::Pending
                }
                Err(e) => return Err(e).context("reading CI status"),
            };
            if self.status.ci_status != Some(status) {
                self.status.ci_status = Some(status);
                self.log(LogLevel::Info, format!("CI status for PR #{pr}: {status}"));
                self.persist().await?;
            }

            match status {
                CiStatus::Success => return Ok(None),
                CiStatus::Absent if checks_seen => {
                    tracing::debug!(issue = self.issue_id, pr, "no checks on the new head yet");
                }
                CiStatus::Absent => {
                    self.log(LogLevel::Info, "no CI checks configured, treating as passing");
                    return Ok(None);
                }
                CiStatus::Failure => {
                    checks_seen = true;
                    if self.status.ci_fix_attempts >= max_fixes {
                        return Ok(Some(Transition::Finish(
                            WorkerPhase::Failed,
                            format!("CI still failing after {max_fixes} fix attempts"),
                        )));
                    }
                    self.status.ci_fix_attempts += 1;
                    let attempt = self.status.ci_fix_attempts;
                    let logs = with_retries(retries, HOST_RETRY_DELAY, || gw.failing_check_logs(pr))
                        .await
                        .unwrap_or_else(|e| format!("(could not fetch check logs: {e})"));
                    self.log(LogLevel::Warn, format!("CI failed, fix attempt {attempt}/{max_fixes}"));
                    self.persist().await?;

                    let request =
                        OracleRequest::fix_ci(&issue, &tree.path, &redact_tail(&logs, MAX_CI_LOG));
                    match self.oracle_step(&request, &format!("Fix CI for #{pr}")).await? {
                        Ok(_) => {}
                        Err(OracleError::Unavailable(msg)) => {
                            return Ok(Some(Transition::Finish(
                                WorkerPhase::Failed,
                                format!("oracle unavailable: {msg}"),
                            )))
                        }
                        Err(e) => self.log(LogLevel::Warn, format!("CI fix attempt failed: {e}")),
                    }
                    self.deps.vcs.push(&tree.path, &tree.branch, false).await?;
                    poller.reset();
                }
                CiStatus::Pending => checks_seen = true,
            }

            if !poller.wait().await {
                return Ok(Some(Transition::Finish(
                    WorkerPhase::Failed,
                    format!(
                        "CI did not finish within {}s",
                        self.settings.ci_timeout.as_secs()
                    ),
                )));
            }
        }
    }

    async fn merge(&mut self) -> anyhow::Result<Transition> {
        let pr = self.pr()?.number;
        let tree = self.tree()?;
        let issue = self.issue().await?;
        let gw = self.deps.gateway.clone();
        let retries = self.settings.max_retries;

        let mut poller = Poller::new(self.settings.ci_timeout, self.settings.ci_poll);
        let mergeability = loop {
            let m = with_retries(retries, HOST_RETRY_DELAY, || gw.mergeability(pr))
                .await
                .context("checking mergeability")?;
            if m != Mergeability::Unknown || !poller.wait().await {
                break m;
            }
        };

        if mergeability == Mergeability::Conflicting {
            self.log(
                LogLevel::Warn,
                format!("PR #{pr} conflicts with {}, trying a rebase", tree.base),
            );
            match self.deps.vcs.rebase_onto(&tree.path, &tree.base).await? {
                RebaseOutcome::Conflicts(files) => {
                    let files = if files.is_empty() {
                        "unknown files".to_string()
                    } else {
                        files.join(", ")
                    };
                    return Ok(Transition::Finish(
                        WorkerPhase::Blocked,
                        format!("merge conflict with {} in: {files}", tree.base),
                    ));
                }
                RebaseOutcome::Clean => {
                    self.deps.vcs.push(&tree.path, &tree.branch, true).await?;
                    let commits = self.deps.vcs.commits_since(&tree.path, &tree.base).await?;
                    self.status.add_commits(commits);
                    self.log(LogLevel::Info, "rebased cleanly, waiting for CI again");
                    self.persist().await?;
                    if let Some(done) = self.await_green().await? {
                        return Ok(done);
                    }
                }
            }
        }

        if self.settings.dry_run || self.settings.auto_merge {
            let title = pr_title(&issue);
            match with_retries(retries, HOST_RETRY_DELAY, || gw.merge_squash(pr, &title)).await {
                Ok(outcome) => {
                    self.log(LogLevel::Info, format!("squash-merged PR #{pr} as {}", outcome.sha));
                    self.status.merge_commit = Some(outcome.sha);
                }
                Err(HostError::Conflict(msg)) => {
                    return Ok(Transition::Finish(
                        WorkerPhase::Blocked,
                        format!("merge of PR #{pr} rejected: {msg}"),
                    ))
                }
                Err(e) => {
                    return Ok(Transition::Finish(
                        WorkerPhase::Failed,
                        format!("merge of PR #{pr} failed: {e}"),
                    ))
                }
            }
        } else {
            let wait = self.settings.merge_wait;
            self.log(
                LogLevel::Info,
                format!("auto-merge off, waiting up to {}s for PR #{pr} to be merged", wait.as_secs()),
            );
            self.persist().await?;
            let mut poller = Poller::new(wait, self.settings.review_poll);
            loop {
                let current = with_retries(retries, HOST_RETRY_DELAY, || gw.get_pr(pr))
                    .await
                    .context("polling pull request")?;
                if current.merged {
                    self.log(LogLevel::Info, format!("PR #{pr} merged by a maintainer"));
                    self.status.merge_commit = current.merge_commit;
                    break;
                }
                if !poller.wait().await {
                    return Ok(Transition::Finish(
                        WorkerPhase::Blocked,
                        format!("awaiting maintainer merge of PR #{pr}"),
                    ));
                }
            }
        }
        Ok(Transition::To(WorkerPhase::VerifyMain))
    }

    async fn verify_main(&mut self) -> anyhow::Result<Transition> {
        let pr = self.pr()?.number;
        let gw = self.deps.gateway.clone();
        let retries = self.settings.max_retries;
        let git_ref = match self.status.merge_commit.clone() {
            Some(sha) => sha,
            None => with_retries(retries, HOST_RETRY_DELAY, || gw.default_branch())
                .await
                .context("resolving default branch")?,
        };

        let timeout = self.settings.main_build_timeout;
        let mut poller = Poller::new(timeout, self.settings.main_poll);
        loop {
            let status =
                match with_retries(retries, HOST_RETRY_DELAY, || gw.main_build_status(&git_ref)).await {
                    Ok(status) => status,
                    Err(e) if e.is_retryable() => CiStatus::Pending,
                    Err(e) => return Err(e).context("reading main branch status"),
                };
            match status {
                CiStatus::Success => {
                    self.status.main_branch_verified = true;
                    return Ok(Transition::Finish(
                        WorkerPhase::Completed,
                        format!("PR #{pr} merged as {git_ref}, main branch checks passed"),
                    ));
                }
                CiStatus::Absent => {
                    return Ok(Transition::Finish(
                        WorkerPhase::Completed,
                        format!("PR #{pr} merged as {git_ref}, no checks on main"),
                    ))
                }
                CiStatus::Failure => {
                    return Ok(Transition::Finish(
                        WorkerPhase::MainBranchFailed,
                        format!("main branch checks failed after merging PR #{pr} ({git_ref})"),
                    ))
                }
                CiStatus::Pending => {}
            }
            if !poller.wait().await {
                self.log(LogLevel::Warn, "main branch checks still pending at timeout");
                return Ok(Transition::Finish(
                    WorkerPhase::Completed,
                    format!(
                        "PR #{pr} merged as {git_ref}, main branch checks still pending after {}s",
                        timeout.as_secs()
                    ),
                ));
            }
        }
    }

    // --- helpers ---

    /// Run the oracle, commit whatever it left in the worktree and undo
    /// any change to protected configuration. The oracle's own result is
    /// returned as-is; only git and I/O problems are errors here.
    async fn oracle_step(
        &mut self,
        request: &OracleRequest,
        message: &str,
    ) -> anyhow::Result<Result<OracleOutcome, OracleError>> {
        let result = self.deps.oracle.run(request).await;
        let tree = self.tree()?;
        let vcs = self.deps.vcs.clone();

        vcs.commit_all(&tree.path, message).await?;
        let restored = vcs
            .restore_protected(&tree.path, &tree.base, &self.settings.protected_paths)
            .await?;
        if !restored.is_empty() {
            self.log(
                LogLevel::Warn,
                format!("reverted changes to protected files: {}", restored.join(", ")),
            );
            vcs.commit_all(&tree.path, "Restore protected configuration files")
                .await?;
        }
        let commits = vcs.commits_since(&tree.path, &tree.base).await?;
        self.status.add_commits(commits);

        if let Ok(outcome) = &result {
            if !outcome.summary.trim().is_empty() {
                self.summary = outcome.summary.trim().to_string();
            }
        }
        self.persist().await?;
        Ok(result)
    }

    async fn issue(&mut self) -> anyhow::Result<Issue> {
        if let Some(issue) = &self.issue {
            return Ok(issue.clone());
        }
        let gw = self.deps.gateway.clone();
        let n = self.issue_id;
        let issue = with_retries(self.settings.max_retries, HOST_RETRY_DELAY, || gw.get_issue(n))
            .await
            .with_context(|| format!("fetching issue #{n}"))?;
        self.status.title = issue.title.clone();
        self.issue = Some(issue.clone());
        Ok(issue)
    }

    fn tree(&self) -> anyhow::Result<Worktree> {
        self.worktree
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no worktree acquired"))
    }

    fn pr(&self) -> anyhow::Result<PrRef> {
        self.status
            .pr
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no pull request recorded"))
    }

    fn mark_processed(&mut self, comment_id: u64) {
        if let Some(pr) = self.status.pr.as_mut() {
            pr.processed_comment_ids.insert(comment_id);
        }
    }

    fn pr_body(&self, issue: &Issue) -> String {
        let summary = if self.summary.is_empty() {
            format!("Automated implementation for #{}.", issue.number)
        } else {
            self.summary.clone()
        };
        let commits: String = self
            .status
            .commits
            .iter()
            .map(|sha| format!("- `{}`\n", &sha[..sha.len().min(12)]))
            .collect();
        format!(
            "{summary}\n\n### Commits\n{commits}\nCloses #{}\n",
            issue.number
        )
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let issue = self.issue_id;
        match level {
            LogLevel::Debug => tracing::debug!(issue, "{message}"),
            LogLevel::Info => tracing::info!(issue, "{message}"),
            LogLevel::Warn => tracing::warn!(issue, "{message}"),
            LogLevel::Error => tracing::error!(issue, "{message}"),
        }
        self.status.push_log(level, message);
    }

    async fn persist(&mut self) -> anyhow::Result<()> {
        self.status.updated_at = Utc::now();
        self.deps
            .store
            .write(&self.status)
            .await
            .context("writing status document")
    }

    async fn notify(&self, event: NotificationEvent) {
        if let Err(e) = self.deps.sink.append(&event).await {
            tracing::warn!(issue = self.issue_id, ?e, "could not append notification");
        }
    }

    async fn transition(&mut self, next: WorkerPhase) -> anyhow::Result<()> {
        let from = self.status.phase;
        self.status.phase = next;
        self.log(LogLevel::Info, format!("{from} -> {next}"));
        self.persist().await?;
        self.notify(
            NotificationEvent::new(NotificationKind::StatusUpdate, self.issue_id, format!("phase: {next}"))
                .with("phase", next.as_str())
                .with("from", from.as_str()),
        )
        .await;
        Ok(())
    }

    async fn finish(&mut self, terminal: WorkerPhase, reason: String) -> anyhow::Result<()> {
        self.status.phase = terminal;
        self.status.reason = Some(reason.clone());
        let level = match terminal {
            WorkerPhase::Completed => LogLevel::Info,
            WorkerPhase::Blocked | WorkerPhase::Abandoned => LogLevel::Warn,
            _ => LogLevel::Error,
        };
        self.log(level, format!("{terminal}: {reason}"));
        let written = self.persist().await;

        let kind = match terminal {
            WorkerPhase::Completed => NotificationKind::Completed,
            WorkerPhase::Blocked => NotificationKind::Blocked,
            WorkerPhase::MainBranchFailed => NotificationKind::MainBranchFailed,
            _ => NotificationKind::Failed,
        };
        let mut event =
            NotificationEvent::new(kind, self.issue_id, reason).with("phase", terminal.as_str());
        if let Some(pr) = &self.status.pr {
            event = event.with("prNumber", pr.number);
        }
        if let Some(sha) = &self.status.merge_commit {
            event = event.with("mergeCommit", sha.as_str());
        }
        self.notify(event).await;
        self.release().await;
        written
    }

    async fn release(&mut self) {
        if let Some(tree) = self.worktree.take() {
            self.deps.isolation.release(&tree, &self.owner).await;
        }
    }
}

fn pr_title(issue: &Issue) -> String {
    format!("{} (closes #{})", issue.title.trim(), issue.number)
}
