//! Human-readable and JSON lines summaries of peak heap usage

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ProfilingError, Result};
use crate::profiler::{Profiler, ProfilerKind};
use crate::toolchain::ToolchainId;

/// Bytes in one binary megabyte
const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Convert a byte count to MiB
#[must_use]
#[allow(clippy::cast_precision_loss)] // Acceptable precision loss for display purposes
pub fn bytes_to_mib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MIB
}

/// Peak heap of one toolchain's run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapSummary {
    toolchain: ToolchainId,
    profiler: ProfilerKind,
    peak_bytes: u64,
    measured_at: DateTime<Utc>,
}

impl HeapSummary {
    /// Create a summary stamped with the current time
    #[must_use]
    pub fn new(toolchain: ToolchainId, profiler: ProfilerKind, peak_bytes: u64) -> Self {
        Self {
            toolchain,
            profiler,
            peak_bytes,
            measured_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn toolchain(&self) -> &ToolchainId {
        &self.toolchain
    }

    #[must_use]
    pub const fn profiler(&self) -> ProfilerKind {
        self.profiler
    }

    #[must_use]
    pub const fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    /// Peak heap in MiB
    #[must_use]
    pub fn peak_mib(&self) -> f64 {
        bytes_to_mib(self.peak_bytes)
    }

    #[must_use]
    pub const fn measured_at(&self) -> &DateTime<Utc> {
        &self.measured_at
    }
}

impl fmt::Display for HeapSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} max heap: {:.1}MiB", self.toolchain, self.peak_mib())
    }
}

/// Baseline vs. candidate peak heap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    baseline: HeapSummary,
    candidate: HeapSummary,
}

impl Comparison {
    #[must_use]
    pub const fn new(baseline: HeapSummary, candidate: HeapSummary) -> Self {
        Self {
            baseline,
            candidate,
        }
    }

    #[must_use]
    pub const fn baseline(&self) -> &HeapSummary {
        &self.baseline
    }

    #[must_use]
    pub const fn candidate(&self) -> &HeapSummary {
        &self.candidate
    }

    /// Candidate minus baseline, in MiB
    #[must_use]
    pub fn delta_mib(&self) -> f64 {
        self.candidate.peak_mib() - self.baseline.peak_mib()
    }

    /// Candidate peak as a multiple of the baseline peak
    ///
    /// `None` when the baseline peak is zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> Option<f64> {
        if self.baseline.peak_bytes == 0 {
            None
        } else {
            Some(self.candidate.peak_bytes as f64 / self.baseline.peak_bytes as f64)
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vs {}: {:+.1}MiB",
            self.candidate.toolchain,
            self.baseline.toolchain,
            self.delta_mib()
        )?;
        if let Some(ratio) = self.ratio() {
            write!(f, " ({ratio:.2}x)")?;
        }
        Ok(())
    }
}

/// Writes one summary line per toolchain
pub struct SummaryReporter<W> {
    out: W,
}

impl<W: Write> SummaryReporter<W> {
    #[must_use]
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// Read the peak heap for `toolchain` through `profiler` and print it
    ///
    /// # Errors
    ///
    /// Propagates the profiler's report errors, or `SummaryWrite` if the
    /// line cannot be written.
    pub fn report(&mut self, toolchain: &ToolchainId, profiler: &dyn Profiler) -> Result<HeapSummary> {
        info!("Reading output for {toolchain}");

        let peak = profiler.peak_heap(toolchain)?;
        let summary = HeapSummary::new(toolchain.clone(), profiler.kind(), peak.bytes());

        info!("{summary}");
        self.write_line(&summary)?;
        Ok(summary)
    }

    /// Print the comparison line
    ///
    /// # Errors
    ///
    /// Returns `SummaryWrite` if the line cannot be written.
    pub fn report_comparison(&mut self, comparison: &Comparison) -> Result<()> {
        info!("{comparison}");
        self.write_line(comparison)
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &dyn fmt::Display) -> Result<()> {
        writeln!(self.out, "{line}").map_err(|e| ProfilingError::SummaryWrite(e.to_string()))
    }
}

/// Append-only JSON lines log of summaries
pub struct SummaryLog {
    output_path: PathBuf,
}

impl SummaryLog {
    #[must_use]
    pub const fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Append a summary to the log file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be written or JSON serialization fails
    pub fn append(&self, summary: &HeapSummary) -> Result<()> {
        let json = serde_json::to_string(summary)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .map_err(|e| ProfilingError::SummaryLog(e.to_string()))?;

        writeln!(file, "{json}").map_err(|e| ProfilingError::SummaryLog(e.to_string()))
    }
}
