#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! Peak heap comparison of a server built with two toolchains
//!
//! The server is built once per toolchain, run under a heap profiler for a
//! fixed observation window, stopped, and the peak heap of each run is read
//! back from the profiler's report.

pub mod command;
pub mod config;
pub mod error;
pub mod locator;
pub mod process;
pub mod profiler;
pub mod report;
pub mod runner;
pub mod summary;
pub mod toolchain;

pub use config::HarnessConfig;
pub use error::{ProfilingError, Result};
pub use locator::{ChildProcessLocator, ProcessEntry, ProcessTable, SystemProcessTable};
pub use process::{ProfileSession, ProfiledProcess};
pub use profiler::{Heaptrack, Massif, Profiler, ProfilerKind};
pub use report::{PeakHeap, parse_peak_heap, read_peak_heap};
pub use runner::{Orchestrator, Phases};
pub use summary::{Comparison, HeapSummary, SummaryLog, SummaryReporter};
pub use toolchain::{Rustup, ToolchainDriver, ToolchainId};
