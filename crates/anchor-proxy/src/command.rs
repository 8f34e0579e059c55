//! Bounded external command execution.
//!
//! Trust-store and proxy-config utilities can hang (a stuck keychain prompt, a
//! dead D-Bus session), so every invocation runs under a timeout and the child
//! is killed when the timeout fires.

use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

/// Timeout for non-interactive commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for commands that show an elevation prompt to the user.
pub const ELEVATED_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Windows flag that keeps console windows from flashing up.
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program did not finish in time.
    #[error("{program} timed out after {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status was zero.
    pub success: bool,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Runs `program` with [`COMMAND_TIMEOUT`].
pub async fn run(program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
    run_with_timeout(program, args, COMMAND_TIMEOUT).await
}

/// Runs `program` and waits at most `timeout` for it.
pub async fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    #[cfg(target_os = "windows")]
    command.creation_flags(CREATE_NO_WINDOW);

    tracing::debug!(program, ?args, "Running command");

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CommandError::Spawn {
                program: program.to_string(),
                source,
            })
        }
        Err(_) => {
            tracing::warn!(program, "Command timed out after {:?}", timeout);
            return Err(CommandError::TimedOut {
                program: program.to_string(),
                timeout,
            });
        }
    };

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output() {
        let out = run("sh", &["-c", "echo hello; echo oops >&2"]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn reports_failure_status() {
        let out = run("sh", &["-c", "exit 3"]).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = run("anchor-definitely-not-a-program", &[]).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let err = run_with_timeout("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }
}
