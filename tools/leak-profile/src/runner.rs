//! Orchestration of a baseline vs. candidate heap comparison
//!
//! Everything runs sequentially: one toolchain is built, profiled and stopped
//! before the next one starts, so at most one monitored server exists at a
//! time and the name-based process lookup stays unambiguous.

use std::process::Command;
use std::thread;

use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::error::{ProfilingError, Result};
use crate::process::{ProfileSession, ProfiledProcess};
use crate::profiler::Profiler;
use crate::summary::{Comparison, HeapSummary, SummaryLog, SummaryReporter};
use crate::toolchain::{BuildRequest, ToolchainDriver, ToolchainId};

/// Which steps of a comparison run to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Phases {
    pub clean: bool,
    pub build: bool,
    pub profile: bool,
    pub summarize: bool,
}

impl Phases {
    /// Clean, build, profile and summarize
    #[must_use]
    pub const fn all() -> Self {
        Self {
            clean: true,
            build: true,
            profile: true,
            summarize: true,
        }
    }

    /// Only read existing reports
    #[must_use]
    pub const fn summary_only() -> Self {
        Self {
            clean: false,
            build: false,
            profile: false,
            summarize: true,
        }
    }
}

impl Default for Phases {
    fn default() -> Self {
        Self::all()
    }
}

/// Drives builds and profiling sessions for both toolchains
pub struct Orchestrator<D> {
    config: HarnessConfig,
    driver: D,
}

impl<D: ToolchainDriver> Orchestrator<D> {
    /// Create an orchestrator for one comparison run
    #[must_use]
    pub const fn new(config: HarnessConfig, driver: D) -> Self {
        Self { config, driver }
    }

    /// Configuration of this run
    #[must_use]
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Toolchain driver used for builds and resolution
    #[must_use]
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// Remove the companion project's build artifacts
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if `cargo clean` fails.
    pub fn clean_test_project(&self) -> Result<()> {
        info!("Cleaning {}", self.config.test_project_dir().display());
        self.driver.clean(&self.config.test_project_manifest())
    }

    /// Build the server with `toolchain` into its own target directory
    ///
    /// # Errors
    ///
    /// Returns `BuildFailed` if the build does not succeed.
    pub fn build(&self, toolchain: &ToolchainId) -> Result<()> {
        let target_dir = self.config.target_dir(toolchain);
        let request = BuildRequest {
            project_dir: self.config.project_dir(),
            target_dir: &target_dir,
            extra_args: self.config.build_args(),
            release: self.config.release(),
        };
        self.driver.build(toolchain, &request)
    }

    /// Command that runs the server for `toolchain` under `profiler`
    ///
    /// The library search variable is overwritten for the child only; the
    /// rest of the environment is inherited.
    ///
    /// # Errors
    ///
    /// Returns `ToolchainResolutionFailed` if the library directory cannot be
    /// determined.
    pub fn monitored_command(
        &self,
        toolchain: &ToolchainId,
        profiler: &dyn Profiler,
    ) -> Result<Command> {
        let library_dir = self.driver.library_dir(toolchain)?;
        info!(
            "> {}={}",
            self.config.library_path_var(),
            library_dir.display()
        );

        let argv: Vec<String> = profiler
            .profile_cmd(toolchain)
            .into_iter()
            .chain(std::iter::once(
                self.config.binary_path(toolchain).display().to_string(),
            ))
            .chain(self.config.binary_args().iter().cloned())
            .collect();

        let mut cmd = self.driver.command(toolchain, &argv);
        cmd.env(self.config.library_path_var(), &library_dir)
            .current_dir(self.config.test_project_dir());
        Ok(cmd)
    }

    /// Run the server under `profiler` for the observation window, then stop it
    ///
    /// Blocks for the whole window. When this returns, the profiler's output
    /// is complete and safe to read. If `finish` fails the wrapper is killed
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `ProfilerNotFound`, `ToolchainResolutionFailed` or
    /// `SpawnFailed` before the window starts, and any termination error
    /// from the profiler afterwards.
    pub fn profile(&self, toolchain: &ToolchainId, profiler: &dyn Profiler) -> Result<()> {
        info!("Profiling {toolchain} with {}", profiler.kind());

        which::which(profiler.executable())
            .map_err(|_| ProfilingError::ProfilerNotFound(profiler.executable().to_string()))?;

        let cmd = self.monitored_command(toolchain, profiler)?;
        let process = ProfiledProcess::spawn(cmd)?;
        let mut session = ProfileSession::new(
            toolchain.clone(),
            profiler.kind(),
            process,
            self.config.observation_window(),
        );

        info!(
            "Letting {toolchain} run for {}s (pid {})",
            session.window().as_secs(),
            session.process().pid()
        );
        thread::sleep(session.window());

        if let Err(e) = profiler.finish(&mut session) {
            session.abort();
            return Err(e);
        }
        info!(
            "Finished {toolchain} {} session started at {}",
            session.profiler(),
            session.started_at()
        );
        Ok(())
    }

    /// Print and return the peak heap summary for `toolchain`
    ///
    /// # Errors
    ///
    /// Propagates report parsing and output errors.
    pub fn summary<W: std::io::Write>(
        &self,
        reporter: &mut SummaryReporter<W>,
        toolchain: &ToolchainId,
        profiler: &dyn Profiler,
    ) -> Result<HeapSummary> {
        let summary = reporter.report(toolchain, profiler)?;
        if let Some(path) = self.config.summary_log() {
            SummaryLog::new(path.to_path_buf()).append(&summary)?;
        }
        Ok(summary)
    }

    /// Run the selected phases for baseline then candidate
    ///
    /// Returns the comparison when summaries were requested and the profiler
    /// produces a textual report; heaptrack output needs its own viewer.
    ///
    /// # Errors
    ///
    /// The first failure of any phase aborts the run.
    pub fn run<W: std::io::Write>(
        &self,
        profiler: &dyn Profiler,
        phases: Phases,
        reporter: &mut SummaryReporter<W>,
    ) -> Result<Option<Comparison>> {
        let [baseline, candidate] = self.config.toolchains();

        if phases.clean {
            self.clean_test_project()?;
        }

        if phases.build {
            self.build(baseline)?;
            self.build(candidate)?;
        }

        if phases.profile {
            self.profile(baseline, profiler)?;
            self.profile(candidate, profiler)?;
        }

        if !phases.summarize {
            return Ok(None);
        }

        match self.summary(reporter, baseline, profiler) {
            Ok(base) => {
                let cand = self.summary(reporter, candidate, profiler)?;
                let comparison = Comparison::new(base, cand);
                reporter.report_comparison(&comparison)?;
                Ok(Some(comparison))
            }
            Err(ProfilingError::ReportUnsupported(kind)) => {
                warn!("{kind} reports have no textual peak; inspect them with heaptrack_print");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
