//! Bounded measurement records.
//!
//! A record holds `(counter value, timestamp)` pairs appended by the user logic
//! thread. Storage is reserved up front so appending never allocates inside the
//! cycle. When the record is full the next append is dropped and the running
//! flag is cleared, which winds the whole executive down.
//!
//! Records are written to CSV only after the writing thread has been joined.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};
use tsn_common::error::RtResult;
use tsn_common::state::RunFlag;
use tsn_common::time::Deadline;

/// One `(counter, timestamp)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Counter value at the time of capture.
    pub value: u64,
    /// Clock reading when the value was captured.
    pub timestamp: Deadline,
}

/// Append-only, pre-allocated sequence of samples.
#[derive(Debug)]
pub struct MeasurementRecord {
    label: &'static str,
    samples: Vec<Sample>,
    capacity: usize,
    run_flag: RunFlag,
    overflowed: bool,
}

impl MeasurementRecord {
    /// Reserve room for `capacity` samples.
    #[must_use]
    pub fn new(label: &'static str, capacity: usize, run_flag: RunFlag) -> Self {
        debug!(label, capacity, "Allocating measurement record");
        Self {
            label,
            samples: Vec::with_capacity(capacity),
            capacity,
            run_flag,
            overflowed: false,
        }
    }

    /// Append a sample.
    ///
    /// Returns `false` and requests shutdown if the record is already full; the
    /// sample is discarded.
    #[inline]
    pub fn append(&mut self, value: u64, timestamp: Deadline) -> bool {
        if self.samples.len() >= self.capacity {
            if !self.overflowed {
                self.overflowed = true;
                info!(
                    label = self.label,
                    capacity = self.capacity,
                    "Measurement record full, requesting shutdown"
                );
            }
            self.run_flag.request_stop();
            return false;
        }
        self.samples.push(Sample { value, timestamp });
        true
    }

    /// Record label ("publisher", "subscriber").
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Samples appended so far.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether an append was rejected for lack of room.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Write one `value,sec.nsec` row per sample.
    ///
    /// # Errors
    ///
    /// Propagates write errors from `out`.
    pub fn write_csv<W: Write>(&self, mut out: W) -> RtResult<()> {
        for sample in &self.samples {
            writeln!(out, "{},{}", sample.value, sample.timestamp)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Create (or truncate) `path` and write the record to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save(&self, path: &Path) -> RtResult<()> {
        let file = File::create(path)?;
        self.write_csv(BufWriter::new(file))?;
        info!(
            label = self.label,
            rows = self.samples.len(),
            path = %path.display(),
            "Measurement record written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_clears_flag() {
        let flag = RunFlag::new();
        let mut record = MeasurementRecord::new("publisher", 3, flag.clone());

        for i in 0..3 {
            assert!(record.append(i, Deadline::new(1, 0)));
        }
        assert!(flag.is_running());

        assert!(!record.append(99, Deadline::new(2, 0)));
        assert_eq!(record.len(), 3);
        assert!(record.overflowed());
        assert!(!flag.is_running());
    }

    #[test]
    fn test_zero_capacity_overflows_immediately() {
        let flag = RunFlag::new();
        let mut record = MeasurementRecord::new("subscriber", 0, flag.clone());
        assert!(!record.append(1, Deadline::default()));
        assert!(record.is_empty());
        assert!(!flag.is_running());
    }

    #[test]
    fn test_csv_rows_pad_nanoseconds() {
        let mut record = MeasurementRecord::new("publisher", 4, RunFlag::new());
        record.append(1, Deadline::new(1_700_000_005, 150_000));
        record.append(2, Deadline::new(1_700_000_005, 987_654_321));
        record.append(3, Deadline::new(7, 5));

        let mut out = Vec::new();
        record.write_csv(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "1,1700000005.000150000\n2,1700000005.987654321\n3,7.000000005\n"
        );
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("publisher_T1.csv");

        let mut record = MeasurementRecord::new("publisher", 2, RunFlag::new());
        record.append(11, Deadline::new(3, 250_000));
        record.save(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "11,3.000250000\n");
    }

    #[test]
    fn test_save_to_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let record = MeasurementRecord::new("publisher", 1, RunFlag::new());
        assert!(record.save(&dir.path().join("missing/out.csv")).is_err());
    }
}
