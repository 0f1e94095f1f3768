//! Toolchain identifiers and the external build/resolution collaborator

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::{self, RunError};
use crate::error::{ProfilingError, Result};

/// Name of a toolchain under comparison, e.g. `leaktest-prev`
///
/// Used verbatim in directory names, report file names and process names, so
/// it must be non-empty and free of whitespace and path separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolchainId(String);

impl ToolchainId {
    /// Validate and wrap a toolchain name
    ///
    /// # Errors
    ///
    /// Returns `InvalidToolchain` if the name is empty or contains whitespace
    /// or a path separator.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && !name
                .chars()
                .any(|c| c.is_whitespace() || c == '/' || c == '\\');

        if valid {
            Ok(Self(name))
        } else {
            Err(ProfilingError::InvalidToolchain(name))
        }
    }

    /// The raw toolchain name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ToolchainId {
    type Error = ProfilingError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ToolchainId> for String {
    fn from(value: ToolchainId) -> Self {
        value.0
    }
}

/// Inputs for one isolated build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest<'a> {
    /// Crate to build
    pub project_dir: &'a Path,

    /// Per-toolchain target directory
    pub target_dir: &'a Path,

    /// Extra cargo arguments
    pub extra_args: &'a [String],

    /// Build with `--release`
    pub release: bool,
}

/// External collaborator that builds with, resolves and runs under a toolchain
pub trait ToolchainDriver {
    /// Build the project with the given toolchain
    ///
    /// # Errors
    ///
    /// Returns `BuildFailed` if the build cannot be run or exits non-zero.
    fn build(&self, toolchain: &ToolchainId, request: &BuildRequest<'_>) -> Result<()>;

    /// Root directory of the toolchain installation
    ///
    /// # Errors
    ///
    /// Returns `ToolchainResolutionFailed` if the toolchain cannot be queried.
    fn sysroot(&self, toolchain: &ToolchainId) -> Result<PathBuf>;

    /// Command that runs `argv` with the toolchain active
    fn command(&self, toolchain: &ToolchainId, argv: &[String]) -> Command;

    /// Remove build artifacts of a companion project
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if the clean cannot be run or exits non-zero.
    fn clean(&self, manifest_path: &Path) -> Result<()>;

    /// Runtime library directory of the toolchain
    ///
    /// # Errors
    ///
    /// Propagates `sysroot` failures.
    fn library_dir(&self, toolchain: &ToolchainId) -> Result<PathBuf> {
        self.sysroot(toolchain).map(|root| root.join("lib"))
    }
}

/// `ToolchainDriver` backed by `rustup run`
#[derive(Debug, Clone, Default)]
pub struct Rustup;

impl Rustup {
    fn run_prefix(toolchain: &ToolchainId) -> Command {
        let mut cmd = Command::new("rustup");
        cmd.arg("run").arg(toolchain.as_str());
        cmd
    }
}

impl ToolchainDriver for Rustup {
    fn build(&self, toolchain: &ToolchainId, request: &BuildRequest<'_>) -> Result<()> {
        info!("Building {toolchain}");

        let mut cmd = Self::run_prefix(toolchain);
        cmd.arg("cargo")
            .arg("build")
            .arg(format!("--target-dir={}", request.target_dir.display()))
            .args(request.extra_args)
            .current_dir(request.project_dir);

        if request.release {
            cmd.arg("--release");
        }

        command::run(&mut cmd).map(|_| ()).map_err(|e| match e {
            RunError::Exit(failure) => ProfilingError::BuildFailed {
                toolchain: toolchain.to_string(),
                code: failure.code,
                stderr: failure.stderr,
            },
            RunError::Launch { source, .. } => ProfilingError::BuildFailed {
                toolchain: toolchain.to_string(),
                code: None,
                stderr: source.to_string(),
            },
        })
    }

    fn sysroot(&self, toolchain: &ToolchainId) -> Result<PathBuf> {
        let mut cmd = Self::run_prefix(toolchain);
        cmd.args(["rustc", "--print", "sysroot"]);

        let stdout = command::run(&mut cmd)
            .map_err(|e| ProfilingError::resolution_failed(toolchain.as_str(), e.reason()))?;

        parse_sysroot(&stdout)
            .ok_or_else(|| ProfilingError::resolution_failed(toolchain.as_str(), "empty sysroot"))
    }

    fn command(&self, toolchain: &ToolchainId, argv: &[String]) -> Command {
        let mut cmd = Self::run_prefix(toolchain);
        cmd.args(argv);
        cmd
    }

    fn clean(&self, manifest_path: &Path) -> Result<()> {
        let mut cmd = Command::new("cargo");
        cmd.arg("clean")
            .arg(format!("--manifest-path={}", manifest_path.display()));

        command::run(&mut cmd)
            .map(|_| ())
            .map_err(|e| ProfilingError::CommandFailed {
                command: e.command().to_string(),
                code: match &e {
                    RunError::Exit(failure) => failure.code,
                    RunError::Launch { .. } => None,
                },
                stderr: e.reason(),
            })
    }
}

/// Extract the sysroot path from `rustc --print sysroot` output
fn parse_sysroot(stdout: &str) -> Option<PathBuf> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}
