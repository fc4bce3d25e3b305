//! Single-writer counter cells shared between role threads.
//!
//! A counter bank is a fixed set of `u64` cells (one primary counter plus the
//! repeated counters) created once at startup. [`counter_bank`] hands out
//! exactly one [`BankWriter`] and a cloneable [`BankReader`]. The writer is not
//! `Clone`, so the only way to mutate a bank is to own the writer: the
//! single-writer rule is carried by the type, and no lock is needed.
//!
//! # Threading Model
//!
//! - **Writer role** (user logic for the producer bank, the receiver for the
//!   consumer bank): owns the [`BankWriter`].
//! - **Readers** (transport, measurement logger, external accessors): hold a
//!   [`BankReader`] and observe each cell atomically. A snapshot across
//!   several cells is not a joint atomic view; each cell is individually
//!   consistent.

use crossbeam_utils::CachePadded;
use static_assertions::const_assert;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum number of cells in one bank (primary plus repeated).
pub const MAX_COUNTERS: usize = 8;

// A full snapshot fits in one 64-byte cache line.
const_assert!(MAX_COUNTERS >= 1);
const_assert!(MAX_COUNTERS * std::mem::size_of::<u64>() <= 64);

/// One counter cell: a value plus a "has been written" flag.
#[derive(Debug)]
struct CounterCell {
    value: CachePadded<AtomicU64>,
    written: AtomicBool,
}

impl CounterCell {
    fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
            written: AtomicBool::new(false),
        }
    }

    #[inline]
    fn store(&self, value: u64) {
        self.value.store(value, Ordering::Release);
        self.written.store(true, Ordering::Release);
    }

    #[inline]
    fn load(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    fn is_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct BankCells {
    label: &'static str,
    cells: Box<[CounterCell]>,
}

/// Create a zero-initialized bank of `len` cells.
///
/// `len` is clamped to `1..=MAX_COUNTERS`.
#[must_use]
pub fn counter_bank(label: &'static str, len: usize) -> (BankWriter, BankReader) {
    let len = len.clamp(1, MAX_COUNTERS);
    let cells = Arc::new(BankCells {
        label,
        cells: (0..len).map(|_| CounterCell::new()).collect(),
    });
    (
        BankWriter {
            cells: Arc::clone(&cells),
        },
        BankReader { cells },
    )
}

/// Exclusive write handle to a counter bank.
///
/// Deliberately neither `Clone` nor `Copy`.
#[derive(Debug)]
pub struct BankWriter {
    cells: Arc<BankCells>,
}

impl BankWriter {
    /// Number of cells in the bank.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.cells.len()
    }

    /// Always false; a bank holds at least the primary counter.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.cells.is_empty()
    }

    /// Label given at creation ("producer", "consumer", ...).
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.cells.label
    }

    /// Store `value` into cell `index`. Out-of-range indices are ignored.
    #[inline]
    pub fn set(&mut self, index: usize, value: u64) {
        if let Some(cell) = self.cells.cells.get(index) {
            cell.store(value);
        }
    }

    /// Current value of cell `index` (0 if out of range).
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        self.cells.cells.get(index).map_or(0, CounterCell::load)
    }

    /// Add one to every cell.
    ///
    /// A plain load/store pair: no read-modify-write is needed because this
    /// handle is the only writer.
    #[inline]
    pub fn increment_all(&mut self) {
        for cell in self.cells.cells.iter() {
            cell.store(cell.load().wrapping_add(1));
        }
    }

    /// Copy a snapshot into the bank, cell by cell.
    ///
    /// Extra snapshot values beyond the bank length are ignored.
    #[inline]
    pub fn store_snapshot(&mut self, snapshot: &CounterSnapshot) {
        for (cell, &value) in self.cells.cells.iter().zip(snapshot.as_slice()) {
            cell.store(value);
        }
    }

    /// Snapshot of every cell.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        snapshot_of(&self.cells)
    }
}

/// Shared read handle to a counter bank.
#[derive(Debug, Clone)]
pub struct BankReader {
    cells: Arc<BankCells>,
}

impl BankReader {
    /// Number of cells in the bank.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.cells.len()
    }

    /// Always false; a bank holds at least the primary counter.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.cells.is_empty()
    }

    /// Label given at creation.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.cells.label
    }

    /// Value of cell `index`, or `None` if it has never been written.
    #[inline]
    #[must_use]
    pub fn load(&self, index: usize) -> Option<u64> {
        self.cells
            .cells
            .get(index)
            .filter(|cell| cell.is_written())
            .map(CounterCell::load)
    }

    /// Value of cell `index` (0 if unwritten or out of range).
    #[inline]
    #[must_use]
    pub fn value(&self, index: usize) -> u64 {
        self.cells.cells.get(index).map_or(0, CounterCell::load)
    }

    /// Value of the primary counter.
    #[inline]
    #[must_use]
    pub fn primary(&self) -> u64 {
        self.value(0)
    }

    /// Snapshot of every cell.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        snapshot_of(&self.cells)
    }
}

fn snapshot_of(bank: &BankCells) -> CounterSnapshot {
    let mut snapshot = CounterSnapshot::default();
    for (slot, cell) in snapshot.values.iter_mut().zip(bank.cells.iter()) {
        *slot = cell.load();
    }
    snapshot.len = bank.cells.len();
    snapshot
}

/// Fixed-size copy of a bank's values, safe to pass by value in the hot loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    values: [u64; MAX_COUNTERS],
    len: usize,
}

impl CounterSnapshot {
    /// Build a snapshot from a slice, truncated to [`MAX_COUNTERS`].
    #[must_use]
    pub fn from_slice(values: &[u64]) -> Self {
        let mut snapshot = Self::default();
        let len = values.len().min(MAX_COUNTERS);
        snapshot.values[..len].copy_from_slice(&values[..len]);
        snapshot.len = len;
        snapshot
    }

    /// Values carried by the snapshot.
    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.values[..self.len]
    }

    /// Primary counter value (0 for an empty snapshot).
    #[must_use]
    pub fn primary(&self) -> u64 {
        self.as_slice().first().copied().unwrap_or(0)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the snapshot carries no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
