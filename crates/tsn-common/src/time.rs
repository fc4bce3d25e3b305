//! Absolute deadline arithmetic.
//!
//! A [`Deadline`] mirrors a kernel `timespec`: whole seconds plus a nanosecond
//! field. The absolute-time wait rejects (or silently truncates) a nanosecond
//! field of one second or more, so every additive update goes through
//! [`Deadline::normalize`] before the value reaches the clock.

use std::fmt;
use std::time::Duration;

/// Nanoseconds in one second.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Nanoseconds in one millisecond.
pub const NSEC_PER_MSEC: f64 = 1_000_000.0;

/// Nanoseconds in one microsecond.
pub const NSEC_PER_USEC: u64 = 1_000;

/// An absolute point on a TAI-like clock, as `(seconds, nanoseconds)`.
///
/// Invariant: `0 <= nsec < NSEC_PER_SEC` once [`normalize`](Self::normalize)
/// has run. All constructors and arithmetic helpers re-establish it. The
/// derived ordering compares seconds first, which is only meaningful for
/// normalized values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize,
)]
pub struct Deadline {
    /// Whole seconds.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: i64,
}

impl Deadline {
    /// Create a normalized deadline.
    #[must_use]
    pub fn new(sec: i64, nsec: i64) -> Self {
        let mut deadline = Self { sec, nsec };
        deadline.normalize();
        deadline
    }

    /// Create a deadline from a nanosecond count since the clock epoch.
    #[must_use]
    pub fn from_nanos(nanos: u64) -> Self {
        let nanos = i128::from(nanos);
        let per_sec = i128::from(NSEC_PER_SEC);
        Self {
            sec: (nanos / per_sec) as i64,
            nsec: (nanos % per_sec) as i64,
        }
    }

    /// Carry whole seconds out of the nanosecond field.
    ///
    /// Afterwards `nsec < NSEC_PER_SEC` and `sec` has grown by exactly
    /// `floor(nsec / NSEC_PER_SEC)`.
    #[inline]
    pub fn normalize(&mut self) {
        if self.nsec >= NSEC_PER_SEC {
            self.sec += self.nsec / NSEC_PER_SEC;
            self.nsec %= NSEC_PER_SEC;
        }
    }

    /// Advance by `nanos` nanoseconds.
    #[inline]
    pub fn add_nanos(&mut self, nanos: u64) {
        self.nsec += nanos as i64;
        self.normalize();
    }

    /// Advance by whole seconds.
    #[inline]
    pub fn add_secs(&mut self, secs: u64) {
        self.sec += secs as i64;
    }

    /// Replace the nanosecond field with `offset_ns`, keeping the seconds.
    ///
    /// Used to align a task's first wake-up to its phase inside a second.
    #[must_use]
    pub fn with_subsec_nanos(mut self, offset_ns: u64) -> Self {
        self.nsec = offset_ns as i64;
        self.normalize();
        self
    }

    /// Total nanoseconds since the clock epoch, saturating at zero.
    #[must_use]
    pub fn as_nanos(&self) -> u64 {
        let total = i128::from(self.sec) * i128::from(NSEC_PER_SEC) + i128::from(self.nsec);
        u64::try_from(total.max(0)).unwrap_or(u64::MAX)
    }

    /// Signed distance from `earlier` to `self` in nanoseconds.
    #[must_use]
    pub fn nanos_since(&self, earlier: Deadline) -> i64 {
        (self.sec - earlier.sec) * NSEC_PER_SEC + (self.nsec - earlier.nsec)
    }
}

impl From<Duration> for Deadline {
    fn from(d: Duration) -> Self {
        Self {
            sec: d.as_secs() as i64,
            nsec: i64::from(d.subsec_nanos()),
        }
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Convert a fractional-millisecond cycle time to whole nanoseconds.
#[must_use]
pub fn cycle_period_ns(cycle_time_ms: f64) -> u64 {
    (cycle_time_ms * NSEC_PER_MSEC).round() as u64
}

/// Offset of a wake phase inside a cycle, in nanoseconds.
///
/// Rounded rather than truncated so that e.g. `250_000 * 0.6` lands on
/// `150_000` and not on `149_999`.
#[must_use]
pub fn phase_offset_ns(period_ns: u64, fraction: f64) -> u64 {
    (period_ns as f64 * fraction).round() as u64
}

/// Launch time handed to the transport for a frame prepared at `wake`.
///
/// The frame leaves at the next cycle boundary plus `transmit_offset_ns`:
/// `wake + (period - period * fraction) + transmit_offset_ns`. The value is
/// independent of when the producer thread actually woke up.
#[must_use]
pub fn transmission_time_ns(
    wake: Deadline,
    period_ns: u64,
    fraction: f64,
    transmit_offset_ns: u64,
) -> u64 {
    let remaining = period_ns - phase_offset_ns(period_ns, fraction).min(period_ns);
    wake.as_nanos() + remaining + transmit_offset_ns
}
