//! Error types for the heap comparison harness.
//!
//! Every failure is fatal to the run that produced it; nothing here is
//! retried or downgraded to a warning.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProfilingError>;

/// Errors raised while building, profiling or summarising a toolchain.
#[derive(Debug, Error)]
pub enum ProfilingError {
    // External collaborators
    #[error("build failed for toolchain '{toolchain}' (exit code {code:?}): {stderr}")]
    BuildFailed {
        toolchain: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("cannot resolve runtime library path for toolchain '{toolchain}': {reason}")]
    ToolchainResolutionFailed { toolchain: String, reason: String },

    #[error("failed to spawn monitored process `{command}`: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("profiler executable '{0}' not found in PATH")]
    ProfilerNotFound(String),

    #[error("command failed: {command} (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    // Report parsing
    #[error("no peak heap entry found in {}", path.display())]
    MissingPeakMarker { path: PathBuf },

    #[error("peak marker at line {line} of {} has no preceding heap sample", path.display())]
    PeakWithoutSample { path: PathBuf, line: usize },

    #[error("malformed heap sample at line {line} of {}: {reason}", path.display())]
    ReportParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("failed to read profiler report {}: {reason}", path.display())]
    ReportRead { path: PathBuf, reason: String },

    #[error("profiler '{0}' does not produce a textual peak heap report")]
    ReportUnsupported(String),

    // Process management
    #[error(
        "expected {expected} process(es) named '{name}' for toolchain '{toolchain}'; found {found}"
    )]
    UnexpectedChildProcessCount {
        toolchain: String,
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("process table unavailable: {0}")]
    ProcessTable(String),

    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },

    // Configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse config {}: {reason}", path.display())]
    ConfigParse { path: PathBuf, reason: String },

    #[error("invalid toolchain identifier '{0}'")]
    InvalidToolchain(String),

    // Summary output
    #[error("failed to write summary: {0}")]
    SummaryWrite(String),

    #[error("summary log error: {0}")]
    SummaryLog(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProfilingError {
    /// Create a toolchain resolution error.
    pub fn resolution_failed(toolchain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolchainResolutionFailed {
            toolchain: toolchain.into(),
            reason: reason.into(),
        }
    }

    /// Create a spawn error.
    pub fn spawn_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a termination error.
    pub fn termination_failed(pid: u32, reason: impl Into<String>) -> Self {
        Self::TerminationFailed {
            pid,
            reason: reason.into(),
        }
    }
}
