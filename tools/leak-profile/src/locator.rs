//! Locating the monitored server among the harness's descendant processes
//!
//! Tracing wrappers like heaptrack are thin launchers: signalling them does not
//! stop the traced program. Instead the real server is found by its exact
//! process name and killed directly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::path::Path;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info};

use crate::error::{ProfilingError, Result};
use crate::toolchain::ToolchainId;

/// One row of an OS process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Process ID
    pub pid: u32,

    /// Parent process ID, if known
    pub parent: Option<u32>,

    /// Executable name, untruncated where the OS allows
    pub name: String,
}

impl ProcessEntry {
    /// Create a process table entry
    #[must_use]
    pub fn new(pid: u32, parent: Option<u32>, name: impl Into<String>) -> Self {
        Self {
            pid,
            parent,
            name: name.into(),
        }
    }
}

/// Source of process information and the ability to kill processes
pub trait ProcessTable {
    /// Snapshot of all processes currently visible
    ///
    /// # Errors
    ///
    /// Returns `ProcessTable` if the OS process list cannot be read.
    fn snapshot(&self) -> Result<Vec<ProcessEntry>>;

    /// Forcefully kill a process
    ///
    /// # Errors
    ///
    /// Returns `TerminationFailed` if the process is gone or refuses the kill.
    fn kill(&self, pid: u32) -> Result<()>;
}

/// Length at which Linux cuts the process name it reports
const KERNEL_NAME_LEN: usize = 15;

/// Undo kernel truncation of a process name
///
/// A name of exactly `KERNEL_NAME_LEN` bytes may be cut short. The file name
/// of `argv[0]` or of the executable replaces it when it extends the name.
fn full_name(name: &str, cmd: &[OsString], exe: Option<&Path>) -> String {
    if name.len() != KERNEL_NAME_LEN {
        return name.to_string();
    }

    cmd.first()
        .map(Path::new)
        .into_iter()
        .chain(exe)
        .filter_map(Path::file_name)
        .map(|file| file.to_string_lossy().into_owned())
        .find(|file| file.starts_with(name))
        .unwrap_or_else(|| name.to_string())
}

/// `ProcessTable` reading the live OS process list through `sysinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::OnlyIfNotSet)
                .with_exe(UpdateKind::OnlyIfNotSet),
        );

        if system.processes().is_empty() {
            return Err(ProfilingError::ProcessTable(
                "no processes visible".to_string(),
            ));
        }

        Ok(system
            .processes()
            .values()
            .filter(|process| process.thread_kind().is_none())
            .map(|process| ProcessEntry {
                pid: process.pid().as_u32(),
                parent: process.parent().map(Pid::as_u32),
                name: full_name(
                    &process.name().to_string_lossy(),
                    process.cmd(),
                    process.exe(),
                ),
            })
            .collect())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let target = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        let process = system
            .process(target)
            .ok_or_else(|| ProfilingError::termination_failed(pid, "process not found"))?;

        if process.kill() {
            Ok(())
        } else {
            Err(ProfilingError::termination_failed(pid, "kill signal rejected"))
        }
    }
}

/// Process name the monitored server runs under for a toolchain
#[must_use]
pub fn process_name(prefix: &str, toolchain: &ToolchainId) -> String {
    format!("{prefix}-{toolchain}")
}

/// Finds descendant processes by exact name
#[derive(Debug, Clone, Default)]
pub struct ChildProcessLocator<T = SystemProcessTable> {
    table: T,
}

impl<T: ProcessTable> ChildProcessLocator<T> {
    /// Create a locator over a process table
    #[must_use]
    pub const fn new(table: T) -> Self {
        Self { table }
    }

    /// The underlying process table
    #[must_use]
    pub const fn table(&self) -> &T {
        &self.table
    }

    /// All transitive descendants of `root` whose name equals `name`
    ///
    /// Returns an empty set when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns `ProcessTable` if the process list cannot be read.
    pub fn descendants_named(&self, root: u32, name: &str) -> Result<Vec<ProcessEntry>> {
        let snapshot = self.table.snapshot()?;
        Ok(descendants_of(&snapshot, root)
            .into_iter()
            .filter(|entry| entry.name == name)
            .collect())
    }

    /// Descendants of `root` named `<prefix>-<toolchain>`, exactly `expected` of them
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedChildProcessCount` when the number of matches differs
    /// from `expected`, including when none match.
    pub fn locate(
        &self,
        root: u32,
        prefix: &str,
        toolchain: &ToolchainId,
        expected: usize,
    ) -> Result<Vec<ProcessEntry>> {
        let name = process_name(prefix, toolchain);
        let matches = self.descendants_named(root, &name)?;
        debug!(
            "found {} descendant(s) of {root} named {name}",
            matches.len()
        );

        if matches.len() == expected {
            Ok(matches)
        } else {
            Err(ProfilingError::UnexpectedChildProcessCount {
                toolchain: toolchain.to_string(),
                name,
                expected,
                found: matches.len(),
            })
        }
    }

    /// Locate the single monitored server for `toolchain` and kill it
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedChildProcessCount` unless exactly one process
    /// matches, or `TerminationFailed` if the kill fails.
    pub fn kill_monitored(&self, root: u32, prefix: &str, toolchain: &ToolchainId) -> Result<u32> {
        let found = self.locate(root, prefix, toolchain, 1)?;
        let target = found.first().map(|entry| entry.pid).ok_or_else(|| {
            ProfilingError::UnexpectedChildProcessCount {
                toolchain: toolchain.to_string(),
                name: process_name(prefix, toolchain),
                expected: 1,
                found: 0,
            }
        })?;

        info!("Killing {} (pid {target})", process_name(prefix, toolchain));
        self.table.kill(target)?;
        Ok(target)
    }
}

/// Transitive descendants of `root` within a process snapshot
///
/// `root` itself is excluded. Cycles in reported parentage are tolerated.
#[must_use]
pub fn descendants_of(snapshot: &[ProcessEntry], root: u32) -> Vec<ProcessEntry> {
    let children: HashMap<u32, Vec<&ProcessEntry>> =
        snapshot.iter().fold(HashMap::new(), |mut acc, entry| {
            if let Some(parent) = entry.parent {
                acc.entry(parent).or_default().push(entry);
            }
            acc
        });

    let mut visited = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut found = Vec::new();

    while let Some(pid) = queue.pop_front() {
        for child in children.get(&pid).into_iter().flatten() {
            if visited.insert(child.pid) {
                found.push((*child).clone());
                queue.push_back(child.pid);
            }
        }
    }

    found
}
