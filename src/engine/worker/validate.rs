//! Local validation (lint, type-check, tests) run inside the worktree
//! before anything is pushed.

use crate::cmd::run_with_timeout;
use crate::redact::redact_tail;
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Output kept per failing check.
const MAX_CHECK_OUTPUT: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Cargo,
    Node,
    Python,
}

impl ProjectKind {
    /// First marker file found in `dir` wins.
    pub fn detect(dir: &Path) -> Option<Self> {
        [
            ("Cargo.toml", Self::Cargo),
            ("package.json", Self::Node),
            ("pyproject.toml", Self::Python),
        ]
        .into_iter()
        .find(|(marker, _)| dir.join(marker).is_file())
        .map(|(_, kind)| kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckCommand {
    pub name: &'static str,
    pub program: &'static str,
    pub args: Vec<String>,
}

impl CheckCommand {
    fn new(name: &'static str, program: &'static str, args: &[&str]) -> Self {
        Self {
            name,
            program,
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

pub fn checks_for(kind: ProjectKind, coverage_threshold: Option<u32>) -> Vec<CheckCommand> {
    match kind {
        ProjectKind::Cargo => vec![
            CheckCommand::new(
                "lint",
                "cargo",
                &["clippy", "--all-targets", "--", "-D", "warnings"],
            ),
            CheckCommand::new("typecheck", "cargo", &["check", "--all-targets"]),
            CheckCommand::new("test", "cargo", &["test"]),
        ],
        ProjectKind::Node => vec![
            CheckCommand::new("lint", "npm", &["run", "lint"]),
            CheckCommand::new("typecheck", "npm", &["run", "typecheck"]),
            CheckCommand::new("test", "npm", &["test", "--", "--run"]),
        ],
        ProjectKind::Python => {
            let mut test = CheckCommand::new("test", "uv", &["run", "pytest"]);
            if let Some(threshold) = coverage_threshold {
                test.args.push("--cov=.".into());
                test.args.push(format!("--cov-fail-under={threshold}"));
            }
            vec![
                CheckCommand::new("lint", "uv", &["run", "ruff", "check", "."]),
                CheckCommand::new("typecheck", "uv", &["run", "mypy", "."]),
                test,
            ]
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub command: String,
    pub passed: bool,
    /// Redacted tail of the combined output. Empty for passing checks.
    pub output: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub project: Option<ProjectKind>,
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Failing checks with their output, for the oracle.
    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("$ {}  # {} failed\n{}", c.command, c.name, c.output))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, dir: &Path) -> anyhow::Result<ValidationReport>;
}

/// Runs the detected project's checks as subprocesses.
pub struct CommandValidator {
    timeout: Duration,
    coverage_threshold: Option<u32>,
}

impl CommandValidator {
    pub fn new(timeout: Duration, coverage_threshold: Option<u32>) -> Self {
        Self {
            timeout,
            coverage_threshold,
        }
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate(&self, dir: &Path) -> anyhow::Result<ValidationReport> {
        let Some(kind) = ProjectKind::detect(dir) else {
            tracing::warn!(dir = %dir.display(), "no recognised project type, skipping validation");
            return Ok(ValidationReport::default());
        };

        let mut report = ValidationReport {
            project: Some(kind),
            checks: Vec::new(),
        };
        for check in checks_for(kind, self.coverage_threshold) {
            let mut cmd = Command::new(check.program);
            cmd.args(&check.args).current_dir(dir);
            let (passed, output) = match run_with_timeout(&mut cmd, self.timeout).await {
                Ok(out) => (out.success, out.combined()),
                // a missing toolchain is a failed check, not a crashed worker
                Err(e) => (false, format!("{e:#}")),
            };
            tracing::info!(check = check.name, passed, "validation check finished");
            report.checks.push(CheckResult {
                name: check.name.to_string(),
                command: check.display(),
                passed,
                output: if passed {
                    String::new()
                } else {
                    redact_tail(&output, MAX_CHECK_OUTPUT)
                },
            });
        }
        Ok(report)
    }
}

/// Glob-lite match of a repository-relative path against protected
/// patterns. `*` stays within one path segment; a pattern without `/`
/// matches the file name at any depth.
pub fn is_protected(path: &str, patterns: &[String]) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    patterns.iter().any(|pattern| {
        let subject = if pattern.contains('/') { path } else { file_name };
        glob_regex(pattern).is_some_and(|re| re.is_match(subject))
    })
}

fn glob_regex(pattern: &str) -> Option<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^/]*");
    Regex::new(&format!("^{body}$")).ok()
}
