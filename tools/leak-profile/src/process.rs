//! Process management for profiled commands

use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};

use crate::command;
use crate::error::{ProfilingError, Result};
use crate::profiler::ProfilerKind;
use crate::toolchain::ToolchainId;

/// Wrapper for managing a profiled process
#[derive(Debug)]
pub struct ProfiledProcess {
    /// The child process handle
    child: Child,

    /// Process ID
    pid: u32,

    /// Rendered command line, kept for error messages
    command: String,
}

impl ProfiledProcess {
    /// Spawn a prepared command, inheriting stdio
    ///
    /// # Errors
    ///
    /// Returns `SpawnFailed` if the process cannot be started.
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        let rendered = command::describe(&cmd);
        debug!("> {rendered}");

        let child = cmd
            .spawn()
            .map_err(|e| ProfilingError::spawn_failed(rendered.as_str(), e.to_string()))?;

        let pid = child.id();

        Ok(Self {
            child,
            pid,
            command: rendered,
        })
    }

    /// Get the process ID
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Command line the process was started with
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Check if the process is still running
    ///
    /// # Errors
    ///
    /// Returns error if process status cannot be determined
    pub fn is_running(&mut self) -> Result<bool> {
        match self.child.try_wait() {
            Ok(None) => Ok(true),
            Ok(Some(_)) => Ok(false),
            Err(e) => Err(ProfilingError::termination_failed(
                self.pid,
                format!("failed to check process status: {e}"),
            )),
        }
    }

    /// Send SIGINT so the process can flush its output and exit
    ///
    /// # Errors
    ///
    /// Returns `TerminationFailed` if the process is not visible or the
    /// platform cannot deliver the signal.
    pub fn interrupt(&self) -> Result<()> {
        let target = Pid::from_u32(self.pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        let process = system
            .process(target)
            .ok_or_else(|| ProfilingError::termination_failed(self.pid, "process not found"))?;

        match process.kill_with(Signal::Interrupt) {
            Some(true) => Ok(()),
            Some(false) => Err(ProfilingError::termination_failed(
                self.pid,
                "interrupt signal rejected",
            )),
            None => Err(ProfilingError::termination_failed(
                self.pid,
                "interrupt signal unsupported on this platform",
            )),
        }
    }

    /// Wait for the process to exit
    ///
    /// # Errors
    ///
    /// Returns error if process wait fails
    pub fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .map_err(|e| ProfilingError::termination_failed(self.pid, format!("wait failed: {e}")))
    }

    /// Kill the process
    ///
    /// # Errors
    ///
    /// Returns error if kill signal fails
    pub fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .map_err(|e| ProfilingError::termination_failed(self.pid, format!("kill failed: {e}")))
    }
}

/// One monitored run of a toolchain's server under a profiler
///
/// Owned by the orchestrator and dropped once the profiler's `finish` has
/// returned.
#[derive(Debug)]
pub struct ProfileSession {
    toolchain: ToolchainId,
    profiler: ProfilerKind,
    process: ProfiledProcess,
    started_at: DateTime<Utc>,
    window: Duration,
}

impl ProfileSession {
    /// Start tracking a freshly spawned process
    #[must_use]
    pub fn new(
        toolchain: ToolchainId,
        profiler: ProfilerKind,
        process: ProfiledProcess,
        window: Duration,
    ) -> Self {
        Self {
            toolchain,
            profiler,
            process,
            started_at: Utc::now(),
            window,
        }
    }

    /// Toolchain being profiled
    #[must_use]
    pub const fn toolchain(&self) -> &ToolchainId {
        &self.toolchain
    }

    /// Profiler wrapping the process
    #[must_use]
    pub const fn profiler(&self) -> ProfilerKind {
        self.profiler
    }

    /// The wrapping process
    #[must_use]
    pub const fn process(&self) -> &ProfiledProcess {
        &self.process
    }

    /// Mutable access for termination
    pub fn process_mut(&mut self) -> &mut ProfiledProcess {
        &mut self.process
    }

    /// When the process was spawned
    #[must_use]
    pub const fn started_at(&self) -> &DateTime<Utc> {
        &self.started_at
    }

    /// Observation window the process is given
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Kill and reap the wrapper after a failed `finish`
    ///
    /// Dropping a `Child` does not kill it. Failures here are only logged.
    pub fn abort(&mut self) {
        warn!(
            "Aborting {} session (pid {}): {}",
            self.toolchain,
            self.process.pid(),
            self.process.command()
        );
        if let Err(e) = self.process.kill() {
            warn!("{e}");
        }
        if let Err(e) = self.process.wait() {
            warn!("{e}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper() -> Result<ProfiledProcess> {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        ProfiledProcess::spawn(cmd)
    }

    #[test]
    fn test_spawn_failure_names_command() {
        let result = ProfiledProcess::spawn(Command::new("leak-profile-no-such-binary"));
        assert!(matches!(
            result,
            Err(ProfilingError::SpawnFailed { ref command, .. }) if command == "leak-profile-no-such-binary"
        ));
    }

    #[test]
    fn test_interrupt_stops_process() {
        let process = sleeper();
        assert!(process.is_ok());
        if let Ok(mut process) = process {
            assert!(process.is_running().is_ok_and(|running| running));
            assert!(process.interrupt().is_ok());

            let status = process.wait();
            assert!(status.is_ok_and(|s| !s.success()));
        }
    }

    #[test]
    fn test_kill_stops_process() {
        if let Ok(mut process) = sleeper() {
            assert!(process.kill().is_ok());
            assert!(process.wait().is_ok());
            assert!(process.is_running().is_ok_and(|running| !running));
        }
    }

    #[test]
    fn test_session_tracks_start_and_window() {
        let toolchain = ToolchainId::new("old");
        if let (Ok(tc), Ok(process)) = (toolchain, sleeper()) {
            let before = Utc::now();
            let mut session =
                ProfileSession::new(tc, ProfilerKind::Massif, process, Duration::from_secs(15));

            assert_eq!(session.toolchain().as_str(), "old");
            assert_eq!(session.window(), Duration::from_secs(15));
            assert!(*session.started_at() >= before);

            let _ = session.process_mut().kill();
            let _ = session.process_mut().wait();
        }
    }

    #[test]
    fn test_abort_reaps_wrapper() {
        let toolchain = ToolchainId::new("old");
        if let (Ok(tc), Ok(process)) = (toolchain, sleeper()) {
            let mut session =
                ProfileSession::new(tc, ProfilerKind::Heaptrack, process, Duration::from_secs(1));
            assert_eq!(session.process().command(), "sleep 30");

            session.abort();
            assert!(session.process_mut().is_running().is_ok_and(|running| !running));
        }
    }
}
