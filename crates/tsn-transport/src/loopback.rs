//! In-process loopback wire.
//!
//! Frames published on the writer group land in a single seqlock-protected
//! slot that the reader group polls. This stands in for a peer that echoes
//! our counters back, and keeps the producer and consumer threads coupled
//! only through atomics.
//!
//! # Threading Model
//!
//! - **Producer thread**: the only writer of the slot.
//! - **Consumer thread**: reads the slot without blocking. A read that races
//!   with a write is abandoned and counted; the frame is picked up on the next
//!   consumer cycle if it is still the latest one.

use crate::{GroupId, GroupRegistry, Publisher, Subscriber, Transport};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;
use tsn_common::counters::{BankWriter, CounterSnapshot, MAX_COUNTERS};
use tsn_common::error::RtResult;

/// Sentinel for "no launch time attached".
const NO_TXTIME: u64 = u64::MAX;

/// The shared frame slot.
#[derive(Debug)]
struct WireSlot {
    /// Sequence number (odd = write in progress).
    sequence: CachePadded<AtomicU64>,
    values: [AtomicU64; MAX_COUNTERS],
    len: AtomicUsize,
    txtime_ns: AtomicU64,
    stats: WireCounters,
}

#[derive(Debug, Default)]
struct WireCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    torn_reads: AtomicU64,
}

impl WireSlot {
    fn new() -> Self {
        Self {
            sequence: CachePadded::new(AtomicU64::new(0)),
            values: std::array::from_fn(|_| AtomicU64::new(0)),
            len: AtomicUsize::new(0),
            txtime_ns: AtomicU64::new(NO_TXTIME),
            stats: WireCounters::default(),
        }
    }

    /// Publish a frame. Single writer only.
    fn write(&self, snapshot: &CounterSnapshot, txtime_ns: Option<u64>) {
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        for (slot, &value) in self.values.iter().zip(snapshot.as_slice()) {
            slot.store(value, Ordering::Relaxed);
        }
        self.len.store(snapshot.len(), Ordering::Relaxed);
        self.txtime_ns
            .store(txtime_ns.unwrap_or(NO_TXTIME), Ordering::Relaxed);

        self.sequence.store(seq.wrapping_add(2), Ordering::Release);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Try to read a complete frame newer than `last_seen`.
    ///
    /// Returns the frame and its sequence number, or `None` if nothing new is
    /// there or a write is in progress.
    fn try_read(&self, last_seen: u64) -> Option<(CounterSnapshot, u64)> {
        let seq1 = self.sequence.load(Ordering::Acquire);
        if seq1 == last_seen {
            return None;
        }
        if seq1 & 1 != 0 {
            self.stats.torn_reads.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut buf = [0u64; MAX_COUNTERS];
        for (dst, src) in buf.iter_mut().zip(&self.values) {
            *dst = src.load(Ordering::Relaxed);
        }
        let len = self.len.load(Ordering::Relaxed).min(MAX_COUNTERS);

        fence(Ordering::Acquire);
        let seq2 = self.sequence.load(Ordering::Relaxed);
        if seq1 != seq2 {
            self.stats.torn_reads.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        Some((CounterSnapshot::from_slice(&buf[..len]), seq1))
    }
}

/// Point-in-time wire statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WireStats {
    /// Frames written by the publisher.
    pub frames_sent: u64,
    /// Frames delivered to the subscriber.
    pub frames_received: u64,
    /// Reads abandoned because a write was in progress.
    pub torn_reads: u64,
}

/// Handle for inspecting the loopback wire from outside the role threads.
#[derive(Debug, Clone)]
pub struct WireProbe {
    slot: Arc<WireSlot>,
}

impl WireProbe {
    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> WireStats {
        let s = &self.slot.stats;
        WireStats {
            frames_sent: s.frames_sent.load(Ordering::Relaxed),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            torn_reads: s.torn_reads.load(Ordering::Relaxed),
        }
    }

    /// Launch time attached to the most recent frame.
    #[must_use]
    pub fn last_txtime_ns(&self) -> Option<u64> {
        match self.slot.txtime_ns.load(Ordering::Acquire) {
            NO_TXTIME => None,
            t => Some(t),
        }
    }
}

/// Transport whose writer group feeds its reader group in-process.
#[derive(Debug)]
pub struct LoopbackTransport {
    slot: Arc<WireSlot>,
    registry: GroupRegistry,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Create an idle wire.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(WireSlot::new()),
            registry: GroupRegistry::default(),
        }
    }

    /// Statistics handle that outlives the transport's groups.
    #[must_use]
    pub fn probe(&self) -> WireProbe {
        WireProbe {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl Transport for LoopbackTransport {
    fn register_writer_group(&mut self, id: GroupId) -> RtResult<Box<dyn Publisher>> {
        self.registry.add(id)?;
        info!(%id, "Loopback writer group registered");
        Ok(Box::new(LoopbackPublisher {
            slot: Arc::clone(&self.slot),
        }))
    }

    fn register_reader_group(&mut self, id: GroupId) -> RtResult<Box<dyn Subscriber>> {
        self.registry.add(id)?;
        info!(%id, "Loopback reader group registered");
        Ok(Box::new(LoopbackSubscriber {
            slot: Arc::clone(&self.slot),
            last_seen: 0,
        }))
    }

    fn unregister(&mut self, id: GroupId) -> RtResult<()> {
        self.registry.remove(id)
    }
}

struct LoopbackPublisher {
    slot: Arc<WireSlot>,
}

impl Publisher for LoopbackPublisher {
    #[inline]
    fn transmit(&mut self, snapshot: &CounterSnapshot, transmission_time_ns: Option<u64>) {
        self.slot.write(snapshot, transmission_time_ns);
    }
}

struct LoopbackSubscriber {
    slot: Arc<WireSlot>,
    last_seen: u64,
}

impl Subscriber for LoopbackSubscriber {
    #[inline]
    fn receive_if_available(&mut self, sink: &mut BankWriter) -> bool {
        match self.slot.try_read(self.last_seen) {
            Some((frame, seq)) => {
                self.last_seen = seq;
                sink.store_snapshot(&frame);
                self.slot
                    .stats
                    .frames_received
                    .fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}
