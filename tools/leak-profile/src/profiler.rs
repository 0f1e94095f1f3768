//! Profiler strategies
//!
//! Massif and heaptrack disagree on how a session is stopped: massif flushes
//! its snapshots on SIGINT, while heaptrack's launcher ignores it and the
//! traced server has to be killed directly. Termination is therefore part of
//! each strategy rather than shared orchestration code.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ProfilingError, Result};
use crate::locator::{ChildProcessLocator, ProcessTable, SystemProcessTable};
use crate::process::ProfileSession;
use crate::report::{self, PeakHeap};
use crate::toolchain::ToolchainId;

/// Which profiler wraps the monitored server
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ProfilerKind {
    /// valgrind massif heap snapshots
    #[default]
    Massif,

    /// heaptrack allocation tracing
    Heaptrack,
}

impl ProfilerKind {
    /// Lowercase name used in config files and on the command line
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Massif => "massif",
            Self::Heaptrack => "heaptrack",
        }
    }
}

impl fmt::Display for ProfilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A way of profiling the monitored server and ending the session
pub trait Profiler {
    /// Which profiler this is
    fn kind(&self) -> ProfilerKind;

    /// Wrapper executable that must be installed
    fn executable(&self) -> &str;

    /// Arguments prepended to the monitored command line
    fn profile_cmd(&self, toolchain: &ToolchainId) -> Vec<String>;

    /// Stop monitoring; on return the profiler's output is complete
    ///
    /// # Errors
    ///
    /// Returns `TerminationFailed` or `UnexpectedChildProcessCount` if the
    /// session cannot be stopped cleanly.
    fn finish(&self, session: &mut ProfileSession) -> Result<()>;

    /// Peak heap measured for a toolchain
    ///
    /// # Errors
    ///
    /// Returns `ReportUnsupported` unless the profiler writes a textual report,
    /// otherwise any report parsing error.
    fn peak_heap(&self, _toolchain: &ToolchainId) -> Result<PeakHeap> {
        Err(ProfilingError::ReportUnsupported(self.kind().to_string()))
    }
}

/// Heap snapshot profiling with `valgrind --tool=massif`
#[derive(Debug, Clone)]
pub struct Massif {
    output_dir: PathBuf,
}

impl Massif {
    /// Write reports as `<output_dir>/<toolchain>.massif`
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Report file for a toolchain
    #[must_use]
    pub fn output_file(&self, toolchain: &ToolchainId) -> PathBuf {
        self.output_dir.join(format!("{toolchain}.massif"))
    }
}

impl Profiler for Massif {
    fn kind(&self) -> ProfilerKind {
        ProfilerKind::Massif
    }

    fn executable(&self) -> &str {
        "valgrind"
    }

    fn profile_cmd(&self, toolchain: &ToolchainId) -> Vec<String> {
        vec![
            "valgrind".to_string(),
            "--tool=massif".to_string(),
            format!("--massif-out-file={}", self.output_file(toolchain).display()),
        ]
    }

    fn finish(&self, session: &mut ProfileSession) -> Result<()> {
        let process = session.process_mut();
        info!("Interrupting massif (pid {})", process.pid());
        process.interrupt()?;

        // massif writes the report while handling SIGINT
        let status = process.wait()?;
        info!("massif exited with {status}");
        Ok(())
    }

    fn peak_heap(&self, toolchain: &ToolchainId) -> Result<PeakHeap> {
        report::read_peak_heap(&self.output_file(toolchain))
    }
}

/// Allocation tracing with `heaptrack`
#[derive(Debug, Clone)]
pub struct Heaptrack<T = SystemProcessTable> {
    locator: ChildProcessLocator<T>,
    process_prefix: String,
    root_pid: u32,
}

impl Heaptrack<SystemProcessTable> {
    /// Kill servers named `<process_prefix>-<toolchain>` below this process
    #[must_use]
    pub fn new(process_prefix: impl Into<String>) -> Self {
        Self::with_table(SystemProcessTable, process_prefix, std::process::id())
    }
}

impl<T: ProcessTable> Heaptrack<T> {
    /// Use a specific process table and root process
    #[must_use]
    pub fn with_table(table: T, process_prefix: impl Into<String>, root_pid: u32) -> Self {
        Self {
            locator: ChildProcessLocator::new(table),
            process_prefix: process_prefix.into(),
            root_pid,
        }
    }

    /// Locator used to find the traced server
    #[must_use]
    pub const fn locator(&self) -> &ChildProcessLocator<T> {
        &self.locator
    }
}

impl<T: ProcessTable> Profiler for Heaptrack<T> {
    fn kind(&self) -> ProfilerKind {
        ProfilerKind::Heaptrack
    }

    fn executable(&self) -> &str {
        "heaptrack"
    }

    fn profile_cmd(&self, _toolchain: &ToolchainId) -> Vec<String> {
        vec!["heaptrack".to_string()]
    }

    fn finish(&self, session: &mut ProfileSession) -> Result<()> {
        let toolchain = session.toolchain().clone();
        self.locator
            .kill_monitored(self.root_pid, &self.process_prefix, &toolchain)?;

        let status = session.process_mut().wait()?;
        info!("heaptrack exited with {status}");
        Ok(())
    }
}

/// Build the configured profiler
#[must_use]
pub fn for_kind(kind: ProfilerKind, output_dir: &Path, process_prefix: &str) -> Box<dyn Profiler> {
    match kind {
        ProfilerKind::Massif => Box::new(Massif::new(output_dir)),
        ProfilerKind::Heaptrack => Box::new(Heaptrack::new(process_prefix)),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::locator::ProcessEntry;
    use std::cell::RefCell;
    use std::io::Write;
    use tempfile::TempDir;

    fn toolchain(name: &str) -> ToolchainId {
        ToolchainId::new(name).unwrap()
    }

    #[test]
    fn test_massif_profile_cmd_names_output_by_toolchain() {
        let massif = Massif::new("/src/rls");
        assert_eq!(
            massif.profile_cmd(&toolchain("leaktest-prev")),
            vec![
                "valgrind",
                "--tool=massif",
                "--massif-out-file=/src/rls/leaktest-prev.massif"
            ]
        );
    }

    #[test]
    fn test_heaptrack_profile_cmd_has_no_arguments() {
        let heaptrack = Heaptrack::new("rls-rustc");
        assert_eq!(heaptrack.profile_cmd(&toolchain("old")), vec!["heaptrack"]);
    }

    #[test]
    fn test_massif_peak_heap_reads_own_report() {
        let dir = TempDir::new().unwrap();
        let massif = Massif::new(dir.path());
        let old = toolchain("old");

        let mut file = std::fs::File::create(massif.output_file(&old)).unwrap();
        writeln!(file, "mem_heap_B=100\nmem_heap_B=250\nheap_tree=peak\nmem_heap_B=50").unwrap();

        assert!(matches!(massif.peak_heap(&old), Ok(p) if p.bytes() == 250));
        assert!(matches!(
            massif.peak_heap(&toolchain("new")),
            Err(ProfilingError::ReportRead { .. })
        ));
    }

    #[test]
    fn test_heaptrack_has_no_textual_report() {
        let heaptrack = Heaptrack::new("rls-rustc");
        assert!(matches!(
            heaptrack.peak_heap(&toolchain("old")),
            Err(ProfilingError::ReportUnsupported(name)) if name == "heaptrack"
        ));
    }

    #[test]
    fn test_for_kind_selects_strategy() {
        let dir = Path::new("/tmp");
        assert_eq!(
            for_kind(ProfilerKind::Massif, dir, "rls-rustc").kind(),
            ProfilerKind::Massif
        );
        assert_eq!(
            for_kind(ProfilerKind::Heaptrack, dir, "rls-rustc").kind(),
            ProfilerKind::Heaptrack
        );
    }

    #[test]
    fn test_kind_parses_from_config() {
        #[derive(Deserialize)]
        struct Holder {
            profiler: ProfilerKind,
        }
        let holder: Holder = toml::from_str("profiler = \"heaptrack\"").unwrap();
        assert_eq!(holder.profiler, ProfilerKind::Heaptrack);
        assert_eq!(ProfilerKind::default().to_string(), "massif");
    }

    #[cfg(unix)]
    mod termination {
        use super::*;
        use crate::process::ProfiledProcess;
        use std::process::Command;
        use std::time::Duration;

        fn sleeping_session(tc: &str, kind: ProfilerKind) -> ProfileSession {
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            let process = ProfiledProcess::spawn(cmd).unwrap();
            ProfileSession::new(toolchain(tc), kind, process, Duration::from_secs(1))
        }

        /// Kills through the real process table but reports the wrapper as
        /// the traced server, standing in for heaptrack's child
        struct WrapperAsServer {
            wrapper: u32,
            killed: RefCell<Vec<u32>>,
        }

        impl ProcessTable for WrapperAsServer {
            fn snapshot(&self) -> Result<Vec<ProcessEntry>> {
                Ok(vec![ProcessEntry::new(
                    self.wrapper,
                    Some(std::process::id()),
                    "rls-rustc-old",
                )])
            }

            fn kill(&self, pid: u32) -> Result<()> {
                self.killed.borrow_mut().push(pid);
                SystemProcessTable.kill(pid)
            }
        }

        #[test]
        fn test_massif_finish_interrupts_and_waits() {
            let mut session = sleeping_session("old", ProfilerKind::Massif);
            let massif = Massif::new("/tmp");

            assert!(massif.finish(&mut session).is_ok());
            assert!(session.process_mut().is_running().is_ok_and(|r| !r));
        }

        #[test]
        fn test_heaptrack_finish_kills_located_server() {
            let mut session = sleeping_session("old", ProfilerKind::Heaptrack);
            let table = WrapperAsServer {
                wrapper: session.process().pid(),
                killed: RefCell::new(Vec::new()),
            };
            let heaptrack = Heaptrack::with_table(table, "rls-rustc", std::process::id());

            assert!(heaptrack.finish(&mut session).is_ok());
            assert_eq!(
                *heaptrack.locator().table().killed.borrow(),
                vec![session.process().pid()]
            );
        }

        #[test]
        fn test_heaptrack_finish_fails_without_server() {
            let mut session = sleeping_session("new", ProfilerKind::Heaptrack);
            let table = WrapperAsServer {
                wrapper: session.process().pid(),
                killed: RefCell::new(Vec::new()),
            };
            let heaptrack = Heaptrack::with_table(table, "rls-rustc", std::process::id());

            let result = heaptrack.finish(&mut session);
            assert!(matches!(
                result,
                Err(ProfilingError::UnexpectedChildProcessCount { found: 0, .. })
            ));

            let _ = session.process_mut().kill();
            let _ = session.process_mut().wait();
        }
    }
}
