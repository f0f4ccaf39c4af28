//! Thin wrappers around `tokio::process::Command` / `std::process::Command`
//! that attach the binary path to any spawn error so "No such file or
//! directory" always says *which* file was missing, plus a bounded runner
//! that kills the child when it outlives its budget.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

/// Extension trait that maps spawn errors to include the program path.
pub trait CommandErrorContext {
    /// Like `.output()` but the error includes the program name.
    fn output_with_context(
        &mut self,
    ) -> impl std::future::Future<Output = anyhow::Result<std::process::Output>>;

    /// Like `.spawn()` but the error includes the program name.
    fn spawn_with_context(&mut self) -> anyhow::Result<tokio::process::Child>;
}

impl CommandErrorContext for tokio::process::Command {
    async fn output_with_context(&mut self) -> anyhow::Result<std::process::Output> {
        let prog = program_name(self.as_std());
        self.output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute `{prog}`: {e}"))
    }

    fn spawn_with_context(&mut self) -> anyhow::Result<tokio::process::Child> {
        let prog = program_name(self.as_std());
        self.spawn()
            .map_err(|e| anyhow::anyhow!("failed to execute `{prog}`: {e}"))
    }
}

/// Sync version for `std::process::Command`.
pub trait SyncCommandErrorContext {
    fn status_with_context(&mut self) -> anyhow::Result<std::process::ExitStatus>;
}

impl SyncCommandErrorContext for std::process::Command {
    fn status_with_context(&mut self) -> anyhow::Result<std::process::ExitStatus> {
        let prog = program_name(self);
        self.status()
            .map_err(|e| anyhow::anyhow!("failed to execute `{prog}`: {e}"))
    }
}

/// Captured result of a bounded command.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CapturedOutput {
    /// stdout and stderr, in that order, for feeding back to a human or the oracle.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Run a command to completion with piped output, killing it after `limit`.
///
/// A timeout is reported as an unsuccessful [`CapturedOutput`] with
/// `timed_out` set, not as an error; spawn failures are errors.
pub async fn run_with_timeout(
    cmd: &mut tokio::process::Command,
    limit: Duration,
) -> anyhow::Result<CapturedOutput> {
    let prog = program_name(cmd.as_std());
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    let child = cmd.spawn_with_context()?;

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => {
            let out = result.map_err(|e| anyhow::anyhow!("waiting for `{prog}`: {e}"))?;
            Ok(CapturedOutput {
                success: out.status.success(),
                code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                timed_out: false,
            })
        }
        // dropping the future drops the child, which kills it
        Err(_) => {
            tracing::error!(program = %prog, timeout_secs = limit.as_secs(), "command timed out, killed");
            Ok(CapturedOutput {
                success: false,
                code: None,
                stdout: String::new(),
                stderr: format!("`{prog}` timed out after {}s", limit.as_secs()),
                timed_out: true,
            })
        }
    }
}

/// Extract the program name from a `std::process::Command`.
fn program_name(cmd: &std::process::Command) -> String {
    let prog: &OsStr = cmd.get_program();
    let path = PathBuf::from(prog);
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_names_the_program() {
        let err = tokio::process::Command::new("definitely-not-a-real-binary-xyz")
            .output_with_context()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn captures_output() {
        let out = run_with_timeout(
            tokio::process::Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert_eq!(out.combined(), "out\nerr");
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let out = run_with_timeout(
            tokio::process::Command::new("sleep").arg("5"),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
    }
}
