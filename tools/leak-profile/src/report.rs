//! Peak heap extraction from massif reports
//!
//! A massif report is a line-oriented sequence of snapshots. Each snapshot
//! carries a `mem_heap_B=<bytes>` line, and the peak snapshot is followed by
//! a `heap_tree=peak` marker. The peak heap is the last sample seen before
//! that marker.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProfilingError, Result};

/// Key of the heap size line in each snapshot
pub const HEAP_SAMPLE_KEY: &str = "mem_heap_B";

/// Marker line following the peak snapshot
pub const PEAK_MARKER: &str = "heap_tree=peak";

/// Peak heap measurement read from a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakHeap {
    /// Heap size at the peak snapshot, in bytes
    bytes: u64,

    /// 1-based line number of the peak marker
    marker_line: usize,
}

impl PeakHeap {
    /// Create a peak measurement
    #[must_use]
    pub const fn new(bytes: u64, marker_line: usize) -> Self {
        Self { bytes, marker_line }
    }

    /// Peak heap size in bytes
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Line of the report holding the peak marker
    #[must_use]
    pub const fn marker_line(&self) -> usize {
        self.marker_line
    }
}

/// What a single report line means to the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportLine {
    Sample(u64),
    Peak,
    Other,
}

/// Read the peak heap from a massif report on disk
///
/// # Errors
///
/// Returns:
/// - `ReportRead` if the file cannot be opened or read
/// - `ReportParse` if a heap sample is not an integer
/// - `PeakWithoutSample` if the marker precedes every sample
/// - `MissingPeakMarker` if the file ends without a marker
pub fn read_peak_heap(path: &Path) -> Result<PeakHeap> {
    let file = File::open(path).map_err(|e| ProfilingError::ReportRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    parse_peak_heap(BufReader::new(file), path)
}

/// Parse the peak heap from any buffered reader
///
/// `source` is only used to name the report in errors. Lines after the
/// marker are never read.
///
/// # Errors
///
/// Same as [`read_peak_heap`].
pub fn parse_peak_heap<R: BufRead>(reader: R, source: &Path) -> Result<PeakHeap> {
    let mut last_sample: Option<u64> = None;

    for (index, line) in reader.lines().enumerate() {
        let line_number = index.saturating_add(1);
        let line = line.map_err(|e| ProfilingError::ReportRead {
            path: source.to_path_buf(),
            reason: format!("line {line_number}: {e}"),
        })?;

        match classify(&line, source, line_number)? {
            ReportLine::Sample(bytes) => last_sample = Some(bytes),
            ReportLine::Peak => {
                return last_sample
                    .map(|bytes| PeakHeap::new(bytes, line_number))
                    .ok_or_else(|| ProfilingError::PeakWithoutSample {
                        path: source.to_path_buf(),
                        line: line_number,
                    });
            }
            ReportLine::Other => {}
        }
    }

    Err(ProfilingError::MissingPeakMarker {
        path: PathBuf::from(source),
    })
}

fn classify(line: &str, source: &Path, line_number: usize) -> Result<ReportLine> {
    if let Some(value) = line
        .strip_prefix(HEAP_SAMPLE_KEY)
        .and_then(|rest| rest.strip_prefix('='))
    {
        return value
            .trim()
            .parse::<u64>()
            .map(ReportLine::Sample)
            .map_err(|e| ProfilingError::ReportParse {
                path: source.to_path_buf(),
                line: line_number,
                reason: format!("'{value}': {e}"),
            });
    }

    if line.trim() == PEAK_MARKER {
        Ok(ReportLine::Peak)
    } else {
        Ok(ReportLine::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn parse(content: &str) -> Result<PeakHeap> {
        parse_peak_heap(Cursor::new(content), Path::new("test.massif"))
    }

    #[test]
    fn test_peak_is_last_sample_before_marker() {
        let report = "mem_heap_B=100\nmem_heap_B=250\nheap_tree=peak\nmem_heap_B=50\n";
        let peak = parse(report);
        assert!(matches!(peak, Ok(p) if p.bytes() == 250 && p.marker_line() == 3));
    }

    #[test]
    fn test_many_samples_before_marker() {
        let report: String = (1..=500_u64)
            .map(|n| format!("snapshot={n}\nmem_heap_B={n}\nheap_tree=empty\n"))
            .chain(std::iter::once("heap_tree=peak\n".to_string()))
            .collect();
        assert!(matches!(parse(&report), Ok(p) if p.bytes() == 500));
    }

    #[test]
    fn test_realistic_snapshot_layout() {
        let report = "\
desc: --massif-out-file=/src/rls/old.massif
cmd: /src/rls/target/old/release/rls --cli
time_unit: i
#-----------
snapshot=0
#-----------
time=0
mem_heap_B=0
mem_heap_extra_B=0
mem_stacks_B=0
heap_tree=empty
#-----------
snapshot=1
#-----------
time=1920398
mem_heap_B=209715200
mem_heap_extra_B=10600
mem_stacks_B=0
heap_tree=peak
n2: 209715200 (heap allocation functions) malloc/new/new[], --alloc-fns, etc.
#-----------
snapshot=2
#-----------
time=2920398
mem_heap_B=1024
heap_tree=detailed
";
        assert!(matches!(parse(report), Ok(p) if p.bytes() == 209_715_200));
    }

    #[test]
    fn test_missing_marker_is_an_error() {
        let err = parse("mem_heap_B=100\n");
        assert!(matches!(err, Err(ProfilingError::MissingPeakMarker { .. })));
    }

    #[test]
    fn test_marker_before_any_sample_is_not_zero() {
        let err = parse("heap_tree=peak\nmem_heap_B=100\n");
        assert!(matches!(
            err,
            Err(ProfilingError::PeakWithoutSample { line: 1, .. })
        ));
    }

    #[test]
    fn test_marker_with_surrounding_whitespace() {
        assert!(matches!(
            parse("mem_heap_B=7\n  heap_tree=peak  \n"),
            Ok(p) if p.bytes() == 7
        ));
    }

    #[test]
    fn test_similar_keys_are_not_samples() {
        let report = "mem_heap_B=10\nmem_heap_extra_B=999\nheap_tree=peak\n";
        assert!(matches!(parse(report), Ok(p) if p.bytes() == 10));
    }

    #[test]
    fn test_non_integer_sample_is_a_parse_error() {
        let err = parse("mem_heap_B=lots\nheap_tree=peak\n");
        assert!(matches!(
            err,
            Err(ProfilingError::ReportParse { line: 1, .. })
        ));
    }

    #[test]
    fn test_empty_report() {
        assert!(matches!(
            parse(""),
            Err(ProfilingError::MissingPeakMarker { .. })
        ));
    }

    #[test]
    fn test_read_from_file_names_path_in_error() {
        let temp_file = NamedTempFile::new().ok();
        if let Some(mut file) = temp_file {
            let _ = writeln!(file, "mem_heap_B=100");
            let _ = file.flush();

            let err = read_peak_heap(file.path());
            let message = err.err().map(|e| e.to_string()).unwrap_or_default();
            assert!(message.starts_with("no peak heap entry found in"));
            assert!(message.contains(&file.path().display().to_string()));
        }
    }

    #[test]
    fn test_read_missing_file() {
        let err = read_peak_heap(Path::new("/nonexistent/leak-profile/old.massif"));
        assert!(matches!(err, Err(ProfilingError::ReportRead { .. })));
    }
}
