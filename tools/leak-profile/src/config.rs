//! Configuration for the heap comparison harness
//!
//! One immutable `HarnessConfig` describes a whole comparison run. It is
//! loaded from TOML and then adjusted with `with_*` overrides from the CLI.
//!
//! ```toml
//! project_dir = "/home/me/src/rls"
//! test_project_dir = "/home/me/src/rls/test-proj"
//! baseline = "leaktest-prev"
//! candidate = "leaktest"
//! observation_window_secs = 15
//! profiler = "massif"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProfilingError, Result};
use crate::profiler::ProfilerKind;
use crate::toolchain::ToolchainId;

/// Maximum allowed observation window (safety limit)
const MAX_WINDOW_SECS: u64 = 3600;

/// Default observation window
const DEFAULT_WINDOW_SECS: u64 = 15;

/// Dynamic library search variable for the current platform
#[cfg(target_os = "macos")]
pub const DEFAULT_LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";

/// Dynamic library search variable for the current platform
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Configuration for a comparison run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Crate containing the monitored server
    project_dir: PathBuf,

    /// Companion project the server works on while profiled
    test_project_dir: PathBuf,

    /// Where profiler reports are written (defaults to `project_dir`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_dir: Option<PathBuf>,

    /// Known-good toolchain
    baseline: ToolchainId,

    /// Toolchain under suspicion
    candidate: ToolchainId,

    /// Build with `--release`
    #[serde(default = "default_release")]
    release: bool,

    /// How long the server runs before being stopped
    #[serde(default = "default_window_secs")]
    observation_window_secs: u64,

    /// Profiler wrapping the server
    #[serde(default)]
    profiler: ProfilerKind,

    /// Name of the server binary in the target directory
    #[serde(default = "default_binary_name")]
    binary_name: String,

    /// Arguments passed to the server
    #[serde(default = "default_binary_args")]
    binary_args: Vec<String>,

    /// Extra cargo build arguments
    #[serde(default = "default_build_args")]
    build_args: Vec<String>,

    /// Server process name prefix; the full name is `<prefix>-<toolchain>`
    #[serde(default = "default_process_prefix")]
    process_prefix: String,

    /// Environment variable receiving the toolchain library directory
    #[serde(default = "default_library_path_var")]
    library_path_var: String,

    /// JSON lines file that summaries are appended to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary_log: Option<PathBuf>,
}

const fn default_release() -> bool {
    true
}

const fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_binary_name() -> String {
    "rls".to_string()
}

fn default_binary_args() -> Vec<String> {
    vec!["--cli".to_string()]
}

fn default_build_args() -> Vec<String> {
    vec!["--no-default-features".to_string()]
}

fn default_process_prefix() -> String {
    "rls-rustc".to_string()
}

fn default_library_path_var() -> String {
    DEFAULT_LIBRARY_PATH_VAR.to_string()
}

impl HarnessConfig {
    /// Create a configuration with defaults for everything but the essentials
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the toolchains are identical or a directory
    /// path is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// # use leak_profile::{HarnessConfig, ToolchainId};
    /// let config = HarnessConfig::new(
    ///     "/src/rls".into(),
    ///     "/src/rls/test-proj".into(),
    ///     ToolchainId::new("leaktest-prev").unwrap(),
    ///     ToolchainId::new("leaktest").unwrap(),
    /// );
    /// assert!(config.is_ok());
    /// ```
    pub fn new(
        project_dir: PathBuf,
        test_project_dir: PathBuf,
        baseline: ToolchainId,
        candidate: ToolchainId,
    ) -> Result<Self> {
        let config = Self {
            project_dir,
            test_project_dir,
            output_dir: None,
            baseline,
            candidate,
            release: default_release(),
            observation_window_secs: DEFAULT_WINDOW_SECS,
            profiler: ProfilerKind::default(),
            binary_name: default_binary_name(),
            binary_args: default_binary_args(),
            build_args: default_build_args(),
            process_prefix: default_process_prefix(),
            library_path_var: default_library_path_var(),
            summary_log: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from TOML text
    ///
    /// `source` only names the origin in errors.
    ///
    /// # Errors
    ///
    /// Returns `ConfigParse` for malformed TOML and `InvalidConfig` if
    /// validation fails.
    pub fn from_toml_str(content: &str, source: &Path) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ProfilingError::ConfigParse {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigParse` if the file cannot be read or parsed, and
    /// `InvalidConfig` if validation fails.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ProfilingError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Override the observation window
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the window is zero or too long.
    pub fn with_observation_window(mut self, window: Duration) -> Result<Self> {
        Self::validate_window(window)?;
        self.observation_window_secs = window.as_secs();
        Ok(self)
    }

    /// Override the profiler
    #[must_use]
    pub fn with_profiler(mut self, profiler: ProfilerKind) -> Self {
        self.profiler = profiler;
        self
    }

    /// Switch between release and debug builds
    #[must_use]
    pub fn with_release(mut self, release: bool) -> Self {
        self.release = release;
        self
    }

    /// Write reports somewhere other than the project directory
    #[must_use]
    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }

    /// Append summaries to a JSON lines file
    #[must_use]
    pub fn with_summary_log(mut self, path: PathBuf) -> Self {
        self.summary_log = Some(path);
        self
    }

    /// Override the server binary name and arguments
    #[must_use]
    pub fn with_binary(mut self, name: impl Into<String>, args: Vec<String>) -> Self {
        self.binary_name = name.into();
        self.binary_args = args;
        self
    }

    /// Override the server process name prefix
    #[must_use]
    pub fn with_process_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.process_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    #[must_use]
    pub fn test_project_dir(&self) -> &Path {
        &self.test_project_dir
    }

    /// Manifest of the companion test project
    #[must_use]
    pub fn test_project_manifest(&self) -> PathBuf {
        self.test_project_dir.join("Cargo.toml")
    }

    /// Directory profiler reports are written to
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        self.output_dir.as_deref().unwrap_or(self.project_dir.as_path())
    }

    #[must_use]
    pub const fn baseline(&self) -> &ToolchainId {
        &self.baseline
    }

    #[must_use]
    pub const fn candidate(&self) -> &ToolchainId {
        &self.candidate
    }

    /// Both toolchains, baseline first
    #[must_use]
    pub fn toolchains(&self) -> [&ToolchainId; 2] {
        [&self.baseline, &self.candidate]
    }

    #[must_use]
    pub const fn release(&self) -> bool {
        self.release
    }

    /// `release` or `debug`, matching cargo's output layout
    #[must_use]
    pub const fn profile_dir_name(&self) -> &'static str {
        if self.release { "release" } else { "debug" }
    }

    #[must_use]
    pub const fn observation_window(&self) -> Duration {
        Duration::from_secs(self.observation_window_secs)
    }

    #[must_use]
    pub const fn profiler(&self) -> ProfilerKind {
        self.profiler
    }

    #[must_use]
    pub fn binary_args(&self) -> &[String] {
        &self.binary_args
    }

    #[must_use]
    pub fn build_args(&self) -> &[String] {
        &self.build_args
    }

    #[must_use]
    pub fn process_prefix(&self) -> &str {
        &self.process_prefix
    }

    #[must_use]
    pub fn library_path_var(&self) -> &str {
        &self.library_path_var
    }

    #[must_use]
    pub fn summary_log(&self) -> Option<&Path> {
        self.summary_log.as_deref()
    }

    /// Isolated cargo target directory for a toolchain
    #[must_use]
    pub fn target_dir(&self, toolchain: &ToolchainId) -> PathBuf {
        self.project_dir.join("target").join(toolchain.as_str())
    }

    /// Server binary produced by building with a toolchain
    #[must_use]
    pub fn binary_path(&self, toolchain: &ToolchainId) -> PathBuf {
        self.target_dir(toolchain)
            .join(self.profile_dir_name())
            .join(&self.binary_name)
    }

    fn validate(&self) -> Result<()> {
        Self::validate_window(self.observation_window())?;

        if self.baseline == self.candidate {
            return Err(ProfilingError::InvalidConfig(format!(
                "baseline and candidate are both '{}'",
                self.baseline
            )));
        }

        let empty_path = [
            ("project_dir", self.project_dir.as_path()),
            ("test_project_dir", self.test_project_dir.as_path()),
        ]
        .into_iter()
        .find(|(_, path)| path.as_os_str().is_empty());

        if let Some((field, _)) = empty_path {
            return Err(ProfilingError::InvalidConfig(format!(
                "{field} cannot be empty"
            )));
        }

        if self.binary_name.is_empty() {
            return Err(ProfilingError::InvalidConfig(
                "binary_name cannot be empty".to_string(),
            ));
        }

        if self.library_path_var.is_empty() || self.library_path_var.contains('=') {
            return Err(ProfilingError::InvalidConfig(format!(
                "invalid library_path_var '{}'",
                self.library_path_var
            )));
        }

        Ok(())
    }

    fn validate_window(window: Duration) -> Result<()> {
        let secs = window.as_secs();
        if secs == 0 {
            Err(ProfilingError::InvalidConfig(
                "observation window must be at least one second".to_string(),
            ))
        } else if secs > MAX_WINDOW_SECS {
            Err(ProfilingError::InvalidConfig(format!(
                "observation window {secs}s exceeds maximum {MAX_WINDOW_SECS}s"
            )))
        } else {
            Ok(())
        }
    }
}
