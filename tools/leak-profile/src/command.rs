//! Helpers for running external commands and echoing them to the log

use std::process::{Command, Output};

use tracing::debug;

/// Outcome of a command that ran to completion with a non-zero status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Rendered command line
    pub command: String,

    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,

    /// Captured standard error
    pub stderr: String,
}

/// Why a command could not produce its output
#[derive(Debug)]
pub enum RunError {
    /// The process could not be started at all
    Launch { command: String, source: std::io::Error },

    /// The process ran and exited unsuccessfully
    Exit(CommandFailure),
}

impl RunError {
    /// Rendered command line of the failed invocation
    #[must_use]
    pub fn command(&self) -> &str {
        match self {
            Self::Launch { command, .. } => command,
            Self::Exit(failure) => &failure.command,
        }
    }

    /// Human-readable reason, used when folding into a domain error
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Launch { source, .. } => source.to_string(),
            Self::Exit(failure) => format!("exit code {:?}: {}", failure.code, failure.stderr),
        }
    }
}

/// Render a command the way a shell user would type it
#[must_use]
pub fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command to completion and return its stdout
///
/// # Errors
///
/// Returns `RunError::Launch` if the process cannot be started and
/// `RunError::Exit` if it exits with a non-zero status.
pub fn run(command: &mut Command) -> Result<String, RunError> {
    let rendered = describe(command);
    debug!("> {rendered}");

    let Output {
        status,
        stdout,
        stderr,
    } = command.output().map_err(|source| RunError::Launch {
        command: rendered.clone(),
        source,
    })?;

    if status.success() {
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    } else {
        Err(RunError::Exit(CommandFailure {
            command: rendered,
            code: status.code(),
            stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_describe_joins_program_and_args() {
        let mut command = Command::new("cargo");
        command.args(["build", "--release"]);
        assert_eq!(describe(&command), "cargo build --release");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_captures_stdout() {
        let output = run(Command::new("sh").args(["-c", "echo hello"]));
        assert!(matches!(output.as_deref(), Ok("hello\n")));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_reports_exit_code_and_stderr() {
        let result = run(Command::new("sh").args(["-c", "echo broken >&2; exit 3"]));
        match result {
            Err(RunError::Exit(failure)) => {
                assert_eq!(failure.code, Some(3));
                assert_eq!(failure.stderr, "broken");
            }
            other => panic!("expected exit failure, got {other:?}"),
        }
    }

    #[test]
    fn test_run_reports_launch_failure() {
        let result = run(&mut Command::new("leak-profile-no-such-binary"));
        assert!(matches!(result, Err(RunError::Launch { .. })));
    }
}
