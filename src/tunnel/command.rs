//! Async subprocess wrapper for the WireGuard tooling.
//!
//! Every external tool invocation goes through `run` (or `run_with_stdin`
//! when key material is piped): bounded by a per-call timeout, killed on
//! expiry, and turned into a structured error carrying stderr on non-zero
//! exit. Nothing else in the crate shells out.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{LanRageError, Result, WireGuardError};

/// Default per-call deadline for external tools
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured output of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...`, waiting at most `timeout`.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    run_with_stdin(program, args, None, timeout).await
}

/// Run a command, optionally writing `stdin` to the child before waiting.
pub async fn run_with_stdin(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput> {
    let rendered = render(program, args);
    tracing::debug!(command = %rendered, "running external tool");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            WireGuardError::ToolMissing {
                tool: program.to_string(),
            }
        } else {
            WireGuardError::Io(e)
        }
    })?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(WireGuardError::Io)?;
            // Close the pipe so the child sees EOF.
            drop(pipe);
        }
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(WireGuardError::Io)?,
        Err(_) => {
            // wait_with_output consumed the child; kill_on_drop reaps it.
            return Err(LanRageError::Timeout {
                operation: rendered,
                seconds: timeout.as_secs(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(WireGuardError::CommandFailed {
            command: rendered,
            status: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        }
        .into());
    }

    Ok(CommandOutput { stdout, stderr })
}

fn render(program: &str, args: &[&str]) -> String {
    let mut s = String::from(program);
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}
