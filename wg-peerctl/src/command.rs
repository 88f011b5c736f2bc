// External command runner

//! Runs external tools (wg, wg-quick, provisioning scripts) with a deadline
//!
//! Every invocation is awaited, its exit status checked, and the child is
//! killed if it outlives the configured timeout.

use crate::error::{PeerError, Result};
use std::ffi::OsStr;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Render a program and its arguments for logs and error messages
fn display_command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Run `program args...`, returning its output if it exits successfully
///
/// # Errors
///
/// - [`PeerError::CommandSpawn`] if the program cannot be started
/// - [`PeerError::CommandTimedOut`] if it runs longer than `timeout`
/// - [`PeerError::CommandFailed`] on a non-zero exit
pub async fn run<S: AsRef<OsStr>>(program: &str, args: &[S], timeout: Duration) -> Result<Output> {
    let command = display_command(program, args);
    log::debug!("Running: {}", command);

    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(result) => result.map_err(|source| PeerError::CommandSpawn {
            command: command.clone(),
            source,
        })?,
        Err(_) => {
            log::error!("{} timed out after {}s", command, timeout.as_secs());
            return Err(PeerError::CommandTimedOut { command, timeout });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log::error!("{} failed ({}): {}", command, output.status, stderr);
        return Err(PeerError::CommandFailed {
            command,
            status: output.status.to_string(),
            stderr,
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let output = run("echo", &["strip", "wg0"], TIMEOUT).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "strip wg0\n");
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let err = run::<&str>("false", &[], TIMEOUT).await.unwrap_err();
        match err {
            PeerError::CommandFailed { command, .. } => assert_eq!(command, "false"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let err = run::<&str>("/nonexistent/wg-peerctl-tool", &[], TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::CommandSpawn { .. }));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let err = run("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::CommandTimedOut { .. }));
    }

    #[test]
    fn test_display_command() {
        assert_eq!(display_command("wg", &["syncconf", "wg0"]), "wg syncconf wg0");
        assert_eq!(display_command::<&str>("true", &[]), "true");
    }
}
