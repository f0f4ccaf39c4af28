//! Git operations inside a worker's worktree: commit, push, rebase and the
//! protected-configuration guard.
//!
//! Local operations always run; in dry-run mode the push is logged and
//! skipped so nothing leaves the machine.

use super::validate::is_protected;
use crate::cmd::CommandErrorContext;
use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// Rebased cleanly onto the base branch.
    Clean,
    /// Rebase stopped on conflicts and was aborted.
    Conflicts(Vec<String>),
}

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Stage everything and commit. `None` when there was nothing to commit.
    async fn commit_all(&self, dir: &Path, message: &str) -> anyhow::Result<Option<String>>;

    /// Commits on HEAD that are not on `base`, oldest first.
    async fn commits_since(&self, dir: &Path, base: &str) -> anyhow::Result<Vec<String>>;

    /// Push the branch; `force` means `--force-with-lease`.
    async fn push(&self, dir: &Path, branch: &str, force: bool) -> anyhow::Result<()>;

    async fn rebase_onto(&self, dir: &Path, base: &str) -> anyhow::Result<RebaseOutcome>;

    /// Undo changes to protected files relative to `base` (tracked files
    /// are checked out from `base`, new ones removed). Returns the paths
    /// that were restored; the caller commits.
    async fn restore_protected(
        &self,
        dir: &Path,
        base: &str,
        patterns: &[String],
    ) -> anyhow::Result<Vec<String>>;
}

pub struct GitVcs {
    dry_run: bool,
}

impl GitVcs {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

/// Run git in `dir`, returning trimmed stdout or an error carrying stderr.
async fn git(dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output_with_context()
        .await?;
    if !out.status.success() {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn lines(s: &str) -> Vec<String> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl Vcs for GitVcs {
    async fn commit_all(&self, dir: &Path, message: &str) -> anyhow::Result<Option<String>> {
        if git(dir, &["status", "--porcelain"]).await?.is_empty() {
            return Ok(None);
        }
        git(dir, &["add", "-A"]).await?;
        git(dir, &["commit", "--no-verify", "-m", message]).await?;
        let sha = git(dir, &["rev-parse", "HEAD"]).await?;
        tracing::info!(dir = %dir.display(), %sha, "committed changes");
        Ok(Some(sha))
    }

    async fn commits_since(&self, dir: &Path, base: &str) -> anyhow::Result<Vec<String>> {
        let range = format!("{base}..HEAD");
        let out = git(dir, &["rev-list", "--reverse", &range]).await?;
        Ok(lines(&out))
    }

    async fn push(&self, dir: &Path, branch: &str, force: bool) -> anyhow::Result<()> {
        if self.dry_run {
            tracing::info!(branch, force, "[DRY-RUN] would push branch");
            return Ok(());
        }
        let mut args = vec!["push", "-u", "origin", branch];
        if force {
            args.push("--force-with-lease");
        }
        git(dir, &args)
            .await
            .with_context(|| format!("pushing {branch}"))?;
        tracing::info!(branch, force, "pushed branch");
        Ok(())
    }

    async fn rebase_onto(&self, dir: &Path, base: &str) -> anyhow::Result<RebaseOutcome> {
        let branch = base.strip_prefix("origin/").unwrap_or(base);
        if let Err(e) = git(dir, &["fetch", "origin", branch]).await {
            tracing::warn!(?e, "fetch before rebase failed, rebasing onto local ref");
        }
        if git(dir, &["rebase", base]).await.is_ok() {
            return Ok(RebaseOutcome::Clean);
        }
        let conflicts = git(dir, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .map(|s| lines(&s))
            .unwrap_or_default();
        git(dir, &["rebase", "--abort"])
            .await
            .context("aborting failed rebase")?;
        Ok(RebaseOutcome::Conflicts(conflicts))
    }

    async fn restore_protected(
        &self,
        dir: &Path,
        base: &str,
        patterns: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let mut changed = lines(&git(dir, &["diff", "--name-only", base]).await?);
        changed.extend(lines(
            &git(dir, &["ls-files", "--others", "--exclude-standard"]).await?,
        ));
        changed.sort();
        changed.dedup();

        let mut restored = Vec::new();
        for path in changed.into_iter().filter(|p| is_protected(p, patterns)) {
            let spec = format!("{base}:{path}");
            if git(dir, &["cat-file", "-e", &spec]).await.is_ok() {
                git(dir, &["checkout", base, "--", &path]).await?;
            } else {
                git(dir, &["rm", "-q", "--cached", "--ignore-unmatch", "--", &path]).await?;
                let full = dir.join(&path);
                if full.exists() {
                    std::fs::remove_file(&full)
                        .with_context(|| format!("removing {}", full.display()))?;
                }
            }
            tracing::warn!(%path, "restored protected file from {base}");
            restored.push(path);
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn sh(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    /// A repo with one commit on `main` and a `work` branch checked out.
    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        sh(p, &["init", "-q", "-b", "main"]);
        sh(p, &["config", "user.email", "t@example.com"]);
        sh(p, &["config", "user.name", "t"]);
        std::fs::write(p.join("pyproject.toml"), "[tool.ruff]\nline-length = 88\n").unwrap();
        std::fs::write(p.join("app.py"), "print('hi')\n").unwrap();
        sh(p, &["add", "-A"]);
        sh(p, &["commit", "-q", "-m", "init"]);
        sh(p, &["checkout", "-q", "-b", "work"]);
        dir
    }

    #[tokio::test]
    async fn commit_all_and_commits_since() {
        let dir = repo();
        let vcs = GitVcs::new(false);
        assert_eq!(vcs.commit_all(dir.path(), "noop").await.unwrap(), None);

        std::fs::write(dir.path().join("app.py"), "print('bye')\n").unwrap();
        let sha = vcs.commit_all(dir.path(), "change").await.unwrap().unwrap();
        let commits = vcs.commits_since(dir.path(), "main").await.unwrap();
        assert_eq!(commits, vec![sha]);
    }

    #[tokio::test]
    async fn restores_protected_config() {
        let dir = repo();
        let vcs = GitVcs::new(false);
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.ruff]\nline-length = 300\n")
            .unwrap();
        std::fs::write(dir.path().join("ruff.toml"), "ignore = [\"E\"]\n").unwrap();
        std::fs::write(dir.path().join("app.py"), "print('fixed')\n").unwrap();

        let patterns = vec!["pyproject.toml".to_string(), "ruff.toml".to_string()];
        let restored = vcs
            .restore_protected(dir.path(), "main", &patterns)
            .await
            .unwrap();
        assert_eq!(restored, vec!["pyproject.toml", "ruff.toml"]);
        assert!(std::fs::read_to_string(dir.path().join("pyproject.toml"))
            .unwrap()
            .contains("88"));
        assert!(!dir.path().join("ruff.toml").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print('fixed')\n"
        );
    }

    #[tokio::test]
    async fn dry_run_push_touches_nothing() {
        let dir = repo();
        // no remote configured: a real push would fail
        GitVcs::new(true).push(dir.path(), "work", false).await.unwrap();
        assert!(GitVcs::new(false).push(dir.path(), "work", false).await.is_err());
    }

    #[tokio::test]
    async fn conflicting_rebase_is_aborted() {
        let dir = repo();
        let p = dir.path();
        let vcs = GitVcs::new(false);
        std::fs::write(p.join("app.py"), "print('work')\n").unwrap();
        vcs.commit_all(p, "work side").await.unwrap();
        sh(p, &["checkout", "-q", "main"]);
        std::fs::write(p.join("app.py"), "print('main')\n").unwrap();
        sh(p, &["commit", "-q", "-am", "main side"]);
        sh(p, &["checkout", "-q", "work"]);

        let outcome = vcs.rebase_onto(p, "main").await.unwrap();
        assert_eq!(outcome, RebaseOutcome::Conflicts(vec!["app.py".into()]));
        assert_eq!(
            std::fs::read_to_string(p.join("app.py")).unwrap(),
            "print('work')\n"
        );
    }
}
