//! Implementation oracle: the coding agent that edits the worktree.
//!
//! The worker only ever talks to [`ImplementationOracle`]; the production
//! adapter shells out to a Claude-compatible CLI.
//!
//! ```bash
//! claude -p --model {model} \
//!   --permission-mode bypassPermissions \
//!   --output-format json \
//!   --disallowedTools 'Bash(rm -rf *),Bash(git push *)' \
//!   "{prompt}"
//! ```
//!
//! The CLI prints one JSON envelope (`{"type": "result", "is_error": ..,
//! "result": ".."}`); `result` is the agent's own summary of what it did.

use crate::cmd::run_with_timeout;
use crate::config::OracleSettings;
use crate::host::Issue;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const DISALLOWED_TOOLS: &[&str] = &[
    "Bash(rm -rf *)",
    "Bash(git push *)",
    "Bash(git reset --hard *)",
    "Bash(gh *)",
];

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// Not installed or not authenticated. Retrying will not help.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("oracle failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleTaskKind {
    Implement,
    FixValidation,
    AddressReview,
    FixCi,
}

/// One unit of work for the oracle, run inside `workdir`.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub kind: OracleTaskKind,
    pub workdir: PathBuf,
    pub prompt: String,
}

impl OracleRequest {
    pub fn implement(issue: &Issue, workdir: &Path) -> Self {
        let body = if issue.body.trim().is_empty() {
            "(no description)"
        } else {
            issue.body.trim()
        };
        Self {
            kind: OracleTaskKind::Implement,
            workdir: workdir.to_path_buf(),
            prompt: format!(
                "Implement a fix for GitHub issue #{n}.\n\n\
                 ## {title}\n\n{body}\n\n\
                 ## Instructions\n\
                 - Make the smallest change that resolves the issue.\n\
                 - Follow the existing code style and conventions.\n\
                 - Add or update tests that cover the change.\n\
                 - Do NOT modify lint, typecheck, test or CI configuration.\n\
                 - Commit your work with descriptive messages as you go.\n\
                 - Finish with a short summary of what you changed.\n",
                n = issue.number,
                title = issue.title.trim(),
            ),
        }
    }

    pub fn fix_validation(issue: &Issue, workdir: &Path, failures: &str) -> Self {
        Self {
            kind: OracleTaskKind::FixValidation,
            workdir: workdir.to_path_buf(),
            prompt: format!(
                "Your changes for issue #{n} ({title}) fail local validation.\n\n\
                 ```\n{failures}\n```\n\n\
                 Fix the code so these checks pass. Do NOT change lint, typecheck, \
                 test or CI configuration, and do not delete or skip tests. \
                 Commit the fix.\n",
                n = issue.number,
                title = issue.title.trim(),
            ),
        }
    }

    pub fn address_review(issue: &Issue, workdir: &Path, comments: &str) -> Self {
        Self {
            kind: OracleTaskKind::AddressReview,
            workdir: workdir.to_path_buf(),
            prompt: format!(
                "A reviewer left blocking feedback on the pull request for issue #{n} \
                 ({title}):\n\n{comments}\n\n\
                 Address every point above, keep unrelated code untouched, and commit \
                 the fix.\n",
                n = issue.number,
                title = issue.title.trim(),
            ),
        }
    }

    pub fn fix_ci(issue: &Issue, workdir: &Path, logs: &str) -> Self {
        Self {
            kind: OracleTaskKind::FixCi,
            workdir: workdir.to_path_buf(),
            prompt: format!(
                "CI is failing on the pull request for issue #{n} ({title}).\n\n\
                 Failing checks:\n```\n{logs}\n```\n\n\
                 Fix the cause of the failure and commit. Do NOT change CI, lint, \
                 typecheck or test configuration.\n",
                n = issue.number,
                title = issue.title.trim(),
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OracleOutcome {
    pub summary: String,
}

#[async_trait]
pub trait ImplementationOracle: Send + Sync {
    async fn run(&self, request: &OracleRequest) -> Result<OracleOutcome, OracleError>;
}

/// Claude-compatible CLI adapter.
pub struct ClaudeOracle {
    settings: OracleSettings,
}

impl ClaudeOracle {
    pub fn new(settings: OracleSettings) -> Self {
        Self { settings }
    }

    fn command(&self, request: &OracleRequest) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.current_dir(&request.workdir).arg("-p");
        if let Some(model) = &self.settings.model {
            cmd.args(["--model", model]);
        }
        cmd.args([
            "--permission-mode",
            "bypassPermissions",
            "--output-format",
            "json",
            "--disallowedTools",
            &DISALLOWED_TOOLS.join(","),
        ])
        .arg(&request.prompt);
        cmd
    }
}

#[async_trait]
impl ImplementationOracle for ClaudeOracle {
    async fn run(&self, request: &OracleRequest) -> Result<OracleOutcome, OracleError> {
        if which::which(&self.settings.binary).is_err() {
            return Err(OracleError::Unavailable(format!(
                "`{}` not found in PATH",
                self.settings.binary
            )));
        }

        tracing::info!(
            kind = ?request.kind,
            workdir = %request.workdir.display(),
            "running oracle"
        );
        let out = run_with_timeout(&mut self.command(request), self.settings.timeout)
            .await
            .map_err(|e| OracleError::Unavailable(format!("{e:#}")))?;

        if out.timed_out {
            return Err(OracleError::Timeout(self.settings.timeout));
        }
        match parse_envelope(&out.stdout) {
            Some(Ok(summary)) if out.success => Ok(OracleOutcome { summary }),
            Some(Err(message)) => Err(classify(&message)),
            _ if out.success => Ok(OracleOutcome {
                summary: out.stdout.trim().to_string(),
            }),
            _ => Err(classify(&out.combined())),
        }
    }
}

/// `Some(Ok(result))` for a successful envelope, `Some(Err(message))` for an
/// `is_error` envelope, `None` when stdout is not an envelope at all.
fn parse_envelope(raw: &str) -> Option<Result<String, String>> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
    let envelope = value.as_object()?;
    if envelope.get("type").and_then(|v| v.as_str()) != Some("result") {
        return None;
    }
    let result = envelope
        .get("result")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let is_error = envelope
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Some(if is_error { Err(result) } else { Ok(result) })
}

/// Auth and billing problems make the oracle unavailable; everything else is
/// an ordinary failed attempt.
fn classify(text: &str) -> OracleError {
    let lower = text.to_lowercase();
    let auth = [
        "unauthorized",
        "invalid api key",
        "not logged in",
        "please run /login",
        "credit balance too low",
        "billing",
    ];
    let message = crate::redact::redact_tail(text.trim(), 500);
    if auth.iter().any(|p| lower.contains(p)) {
        OracleError::Unavailable(message)
    } else {
        OracleError::Failed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue() -> Issue {
        Issue {
            number: 42,
            title: "Parser panics on empty input".into(),
            body: "Steps: run with `''`".into(),
            labels: vec!["bug".into()],
            linked_pr: None,
            url: None,
        }
    }

    #[test]
    fn implement_prompt_carries_issue_and_guardrails() {
        let req = OracleRequest::implement(&issue(), Path::new("/wt"));
        assert_eq!(req.kind, OracleTaskKind::Implement);
        assert!(req.prompt.contains("issue #42"));
        assert!(req.prompt.contains("## Parser panics on empty input"));
        assert!(req.prompt.contains("Do NOT modify lint, typecheck, test or CI configuration"));
    }

    #[test]
    fn fix_prompts_embed_feedback() {
        let req = OracleRequest::fix_validation(&issue(), Path::new("/wt"), "E501 line too long");
        assert!(req.prompt.contains("E501 line too long"));
        let req = OracleRequest::address_review(&issue(), Path::new("/wt"), "- **a.rs:3**: must fix");
        assert_eq!(req.kind, OracleTaskKind::AddressReview);
        assert!(req.prompt.contains("- **a.rs:3**: must fix"));
    }

    #[test]
    fn envelope_success_and_error() {
        let ok = r#"{"type":"result","is_error":false,"result":"Added a guard for empty input."}"#;
        assert_eq!(parse_envelope(ok), Some(Ok("Added a guard for empty input.".into())));

        let err = r#"{"type":"result","is_error":true,"result":"Credit balance too low"}"#;
        assert_eq!(parse_envelope(err), Some(Err("Credit balance too low".into())));

        assert_eq!(parse_envelope("plain text"), None);
        assert_eq!(parse_envelope(r#"{"type":"assistant"}"#), None);
    }

    #[test]
    fn auth_failures_are_unavailable() {
        assert!(matches!(classify("Credit balance too low"), OracleError::Unavailable(_)));
        assert!(matches!(classify("Invalid API key"), OracleError::Unavailable(_)));
        assert!(matches!(classify("tool call failed"), OracleError::Failed(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let oracle = ClaudeOracle::new(OracleSettings {
            binary: "definitely-not-an-oracle-xyz".into(),
            model: None,
            timeout: Duration::from_secs(5),
        });
        let req = OracleRequest::implement(&issue(), Path::new("/tmp"));
        let err = oracle.run(&req).await.unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }
}
