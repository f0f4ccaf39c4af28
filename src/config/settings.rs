//! Typed worker and manager settings.
//!
//! Built from config lookups (`worker.*`, `manager.*`) over hard defaults;
//! CLI flags are applied on top by the caller. Construction takes a lookup
//! function so tests never touch the real config files.

use super::{parse_bool, split_list};
use std::time::Duration;

/// Files a worker must never change to make validation pass.
pub const DEFAULT_PROTECTED_PATHS: &[&str] = &[
    "Cargo.toml",
    "clippy.toml",
    ".clippy.toml",
    "rustfmt.toml",
    ".rustfmt.toml",
    "package.json",
    "tsconfig*.json",
    ".eslintrc*",
    "eslint.config.*",
    "vitest.config.*",
    "jest.config.*",
    "pyproject.toml",
    "setup.cfg",
    "mypy.ini",
    "ruff.toml",
    ".ruff.toml",
    "pytest.ini",
    "tox.ini",
    ".coveragerc",
    ".pre-commit-config.yaml",
    ".github/workflows/*",
];

/// How the manager runs its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// A tokio task inside the manager process.
    Task,
    /// A `drover worker run` child process.
    Process,
}

impl std::str::FromStr for WorkerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "process" => Ok(Self::Process),
            other => anyhow::bail!("unknown worker mode: {other} (expected task or process)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleSettings {
    pub binary: String,
    pub model: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Bounded retries for host calls.
    pub max_retries: u32,
    /// Oracle attempts for IMPLEMENT and VALIDATE combined.
    pub implement_attempts: u32,
    pub review_timeout: Duration,
    pub review_poll: Duration,
    pub ci_timeout: Duration,
    pub ci_poll: Duration,
    /// CI fix iterations before FAILED.
    pub ci_max_fixes: u32,
    pub main_build_timeout: Duration,
    pub main_poll: Duration,
    pub merge_wait: Duration,
    pub validate_timeout: Duration,
    pub coverage_threshold: Option<u32>,
    pub auto_merge: bool,
    pub dry_run: bool,
    pub protected_paths: Vec<String>,
    pub oracle: OracleSettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl WorkerSettings {
    pub fn load() -> Self {
        Self::from_lookup(|key| super::get(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let num = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let secs = |key: &str, default: u64| Duration::from_secs(num(key, default));

        let coverage = num("worker.coverage_threshold", 70);
        Self {
            max_retries: num("worker.max_retries", 3) as u32,
            implement_attempts: num("worker.implement_attempts", 3).max(1) as u32,
            review_timeout: secs("worker.review_timeout_seconds", 600),
            review_poll: secs("worker.review_poll_seconds", 15),
            ci_timeout: secs("worker.ci_timeout_seconds", 600),
            ci_poll: secs("worker.ci_poll_seconds", 30),
            ci_max_fixes: num("worker.ci_max_fixes", 3) as u32,
            main_build_timeout: secs("worker.main_build_timeout_seconds", 300),
            main_poll: secs("worker.main_poll_seconds", 15),
            merge_wait: secs("worker.merge_wait_seconds", 3600),
            validate_timeout: secs("worker.validate_timeout_seconds", 300),
            coverage_threshold: (coverage > 0).then_some(coverage.min(100) as u32),
            auto_merge: lookup("worker.auto_merge")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            dry_run: false,
            protected_paths: lookup("worker.protected_paths")
                .map(|v| parse_list(&v))
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| DEFAULT_PROTECTED_PATHS.iter().map(|s| s.to_string()).collect()),
            oracle: OracleSettings {
                binary: lookup("worker.oracle.binary").unwrap_or_else(|| "claude".to_string()),
                model: lookup("worker.oracle.model").filter(|m| !m.trim().is_empty()),
                timeout: secs("worker.oracle.timeout_seconds", 1800),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    pub max_workers: usize,
    pub worker_timeout: Duration,
    pub allow_labels: Vec<String>,
    pub deny_labels: Vec<String>,
    pub issue_poll: Duration,
    pub worker_poll: Duration,
    pub notify_on_block: bool,
    pub notify_on_main_failure: bool,
    pub worker_mode: WorkerMode,
    pub dry_run: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ManagerSettings {
    pub fn load() -> Self {
        Self::from_lookup(|key| super::get(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let num = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| {
            lookup(key)
                .and_then(|v| parse_bool(&v))
                .unwrap_or(default)
        };
        let list = |key: &str, default: &[&str]| {
            lookup(key)
                .map(|v| parse_list(&v))
                .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
        };

        Self {
            max_workers: num("manager.max_workers", 3).max(1) as usize,
            worker_timeout: Duration::from_secs(num("manager.worker_timeout_hours", 4) * 3600),
            allow_labels: list(
                "manager.allow_labels",
                &["good-first-issue", "bug", "enhancement"],
            ),
            deny_labels: list(
                "manager.deny_labels",
                &["wontfix", "duplicate", "invalid", "manual"],
            ),
            issue_poll: Duration::from_secs(num("manager.issue_poll_seconds", 60)),
            worker_poll: Duration::from_secs(num("manager.worker_poll_seconds", 30)),
            notify_on_block: flag("manager.notify_on_block", true),
            notify_on_main_failure: flag("manager.notify_on_main_failure", true),
            worker_mode: lookup("manager.worker_mode")
                .and_then(|v| v.parse().ok())
                .unwrap_or(WorkerMode::Task),
            dry_run: false,
        }
    }
}

/// Config lists arrive rendered: either a comma string or a YAML sequence
/// dumped as `- a\n- b\n`.
fn parse_list(raw: &str) -> Vec<String> {
    if raw.lines().any(|l| l.trim_start().starts_with("- ")) {
        raw.lines()
            .filter_map(|l| l.trim_start().strip_prefix("- "))
            .map(|s| s.trim().trim_matches(['"', '\'']).to_string())
            .filter(|s| !s.is_empty())
            .collect()
    } else {
        split_list(raw)
    }
}
