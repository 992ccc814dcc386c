//! External command execution with timeouts
//!
//! Provisioner and cloud CLIs are driven through `tokio::process`. Every
//! execution is bounded; a timed-out child is killed when its handle drops.

use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr, for matching error patterns
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Run a command with timeout
///
/// `Err` means the command could not produce an exit status (spawn failure
/// or timeout). A non-zero exit is returned as `Ok` with `success == false`
/// so callers can inspect the output.
pub(crate) async fn run_command(
    cmd: &mut Command,
    description: &str,
    timeout: Duration,
) -> Result<CommandOutput, String> {
    info!("{}", description);
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            warn!("{} timed out after {:?}", description, timeout);
            format!("timed out after {:?}", timeout)
        })?
        .map_err(|e| {
            warn!("{} spawn failed: {}", description, e);
            format!("failed to execute: {}", e)
        })?;

    let result = CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    if result.success {
        debug!("{} succeeded", description);
    } else {
        warn!(
            code = ?result.code,
            "{} failed: {}",
            description,
            result.stderr.trim()
        );
    }
    Ok(result)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello"]);
        let out = run_command(&mut cmd, "echo", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo broken >&2; exit 3"]);
        let out = run_command(&mut cmd, "fail", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert!(out.combined().contains("broken"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let mut cmd = Command::new("/nonexistent/stackverify-binary");
        let err = run_command(&mut cmd, "missing", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.contains("failed to execute"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let err = run_command(&mut cmd, "sleep", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.contains("timed out"));
    }
}
