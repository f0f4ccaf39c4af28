//! Filesystem layout.
//!
//! Everything lives under the drover home (`~/.drover/`, or `$DROVER_HOME`)
//! unless overridden by CLI flags or `paths.*` config keys:
//!
//! ```text
//! ~/.drover/
//!   config.yml
//!   status/worker-{n}.json, status/manager.json, status/archive/
//!   worktrees/issue-{n}/, worktrees/.leases/issue-{n}.json
//!   notifications.jsonl
//!   escalations.jsonl
//! ```

use std::path::PathBuf;

const HOME_DIR: &str = ".drover";

/// The drover home directory. Not created here.
pub fn drover_home() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("DROVER_HOME") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.join(HOME_DIR))
}

/// Path to the global config file (`~/.drover/config.yml`).
pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(drover_home()?.join("config.yml"))
}

/// Explicit path choices from the command line.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub base_dir: Option<PathBuf>,
    pub status_dir: Option<PathBuf>,
    pub worktree_dir: Option<PathBuf>,
    pub notification_file: Option<PathBuf>,
    pub escalation_file: Option<PathBuf>,
}

/// Resolved filesystem layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub base_dir: PathBuf,
    pub status_dir: PathBuf,
    pub worktree_dir: PathBuf,
    pub notification_file: PathBuf,
    pub escalation_file: PathBuf,
}

impl Paths {
    /// Flags win, then `paths.*` config keys, then defaults under the base dir.
    pub fn resolve(overrides: &PathOverrides) -> anyhow::Result<Self> {
        Self::resolve_with(overrides, |key| crate::config::get(key).ok(), drover_home)
    }

    pub(crate) fn resolve_with(
        overrides: &PathOverrides,
        lookup: impl Fn(&str) -> Option<String>,
        default_base: impl FnOnce() -> anyhow::Result<PathBuf>,
    ) -> anyhow::Result<Self> {
        let pick = |flag: &Option<PathBuf>, key: &str| -> Option<PathBuf> {
            flag.clone()
                .or_else(|| lookup(key).map(|v| expand_tilde(&v)))
        };

        let base_dir = match pick(&overrides.base_dir, "paths.base_dir") {
            Some(dir) => dir,
            None => default_base()?,
        };
        Ok(Self {
            status_dir: pick(&overrides.status_dir, "paths.status_dir")
                .unwrap_or_else(|| base_dir.join("status")),
            worktree_dir: pick(&overrides.worktree_dir, "paths.worktree_dir")
                .unwrap_or_else(|| base_dir.join("worktrees")),
            notification_file: pick(&overrides.notification_file, "paths.notification_file")
                .unwrap_or_else(|| base_dir.join("notifications.jsonl")),
            escalation_file: pick(&overrides.escalation_file, "paths.escalation_file")
                .unwrap_or_else(|| base_dir.join("escalations.jsonl")),
            base_dir,
        })
    }

    /// Create the directories (files are created on first append).
    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [&self.base_dir, &self.status_dir, &self.worktree_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn manager_status_file(&self) -> PathBuf {
        self.status_dir.join("manager.json")
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hang_off_base_dir() {
        let paths = Paths::resolve_with(
            &PathOverrides::default(),
            |_| None,
            || Ok(PathBuf::from("/tmp/dh")),
        )
        .unwrap();
        assert_eq!(paths.status_dir, PathBuf::from("/tmp/dh/status"));
        assert_eq!(paths.worktree_dir, PathBuf::from("/tmp/dh/worktrees"));
        assert_eq!(paths.notification_file, PathBuf::from("/tmp/dh/notifications.jsonl"));
        assert_eq!(paths.escalation_file, PathBuf::from("/tmp/dh/escalations.jsonl"));
        assert_eq!(paths.manager_status_file(), PathBuf::from("/tmp/dh/status/manager.json"));
    }

    #[test]
    fn flags_beat_config_beat_defaults() {
        let overrides = PathOverrides {
            status_dir: Some(PathBuf::from("/flag/status")),
            ..Default::default()
        };
        let paths = Paths::resolve_with(
            &overrides,
            |key| match key {
                "paths.status_dir" => Some("/cfg/status".into()),
                "paths.worktree_dir" => Some("/cfg/wt".into()),
                _ => None,
            },
            || Ok(PathBuf::from("/base")),
        )
        .unwrap();
        assert_eq!(paths.status_dir, PathBuf::from("/flag/status"));
        assert_eq!(paths.worktree_dir, PathBuf::from("/cfg/wt"));
        assert_eq!(paths.notification_file, PathBuf::from("/base/notifications.jsonl"));
    }

    #[test]
    fn ensure_creates_directories() {
        let temp = tempfile::TempDir::new().unwrap();
        let overrides = PathOverrides {
            base_dir: Some(temp.path().join("home")),
            ..Default::default()
        };
        let paths = Paths::resolve_with(&overrides, |_| None, || unreachable!()).unwrap();
        paths.ensure().unwrap();
        assert!(paths.status_dir.is_dir());
        assert!(paths.worktree_dir.is_dir());
    }
}
