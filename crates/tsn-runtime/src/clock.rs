//! Clocks that role threads read and sleep on.
//!
//! [`SystemClock`] wraps `clock_gettime` / `clock_nanosleep(TIMER_ABSTIME)` on
//! the configured clock id, so a deadline computed once is never shifted by the
//! time spent computing it. [`SimulatedClock`] jumps straight to each deadline
//! and makes the whole executive deterministic under test.

use std::sync::atomic::{AtomicU64, Ordering};
use tsn_common::config::ClockSource;
use tsn_common::time::{Deadline, NSEC_PER_SEC};

/// Time source for the periodic task runner.
pub trait Clock: Send + Sync {
    /// Current absolute time.
    fn now(&self) -> Deadline;

    /// Block until the clock reaches `deadline`.
    ///
    /// Returns immediately if the deadline has already passed. `deadline` must
    /// be normalized.
    fn sleep_until(&self, deadline: Deadline);
}

/// Kernel clock selected by [`ClockSource`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    source: ClockSource,
}

impl SystemClock {
    /// Create a clock reading `source`.
    #[must_use]
    pub fn new(source: ClockSource) -> Self {
        Self { source }
    }

    /// Configured clock source.
    #[must_use]
    pub fn source(&self) -> ClockSource {
        self.source
    }

    #[cfg(target_os = "linux")]
    fn clock_id(&self) -> libc::clockid_t {
        match self.source {
            ClockSource::Tai => libc::CLOCK_TAI,
            ClockSource::Monotonic => libc::CLOCK_MONOTONIC,
            ClockSource::Realtime => libc::CLOCK_REALTIME,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(ClockSource::default())
    }
}

#[cfg(target_os = "linux")]
impl Clock for SystemClock {
    fn now(&self) -> Deadline {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer and the clock id is one of the
        // constants above, so the call cannot fail.
        unsafe {
            libc::clock_gettime(self.clock_id(), &mut ts);
        }
        Deadline::new(i64::from(ts.tv_sec), i64::from(ts.tv_nsec))
    }

    fn sleep_until(&self, deadline: Deadline) {
        let ts = libc::timespec {
            tv_sec: deadline.sec as libc::time_t,
            tv_nsec: deadline.nsec as libc::c_long,
        };
        loop {
            // SAFETY: `ts` is a normalized timespec; no remaining-time pointer
            // is needed with TIMER_ABSTIME.
            let rc = unsafe {
                libc::clock_nanosleep(
                    self.clock_id(),
                    libc::TIMER_ABSTIME,
                    &ts,
                    std::ptr::null_mut(),
                )
            };
            // An absolute sleep interrupted by a signal resumes with the same deadline.
            if rc != libc::EINTR {
                break;
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Clock for SystemClock {
    fn now(&self) -> Deadline {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Deadline::from(since_epoch)
    }

    fn sleep_until(&self, deadline: Deadline) {
        let remaining = deadline.nanos_since(self.now());
        if remaining > 0 {
            std::thread::sleep(std::time::Duration::from_nanos(remaining as u64));
        }
    }
}

/// Deterministic clock for tests and dry runs.
///
/// Time only moves when a thread sleeps: `sleep_until` advances the clock to
/// the deadline (never backwards) and returns at once. With several threads
/// sharing one clock, time is the furthest deadline any of them has reached.
#[derive(Debug)]
pub struct SimulatedClock {
    now_ns: AtomicU64,
}

impl SimulatedClock {
    /// Create a clock starting at `start`.
    #[must_use]
    pub fn new(start: Deadline) -> Self {
        Self {
            now_ns: AtomicU64::new(start.as_nanos()),
        }
    }

    /// Create a clock starting at `secs` whole seconds.
    #[must_use]
    pub fn at_secs(secs: u64) -> Self {
        Self::new(Deadline::from_nanos(secs * NSEC_PER_SEC as u64))
    }

    /// Move the clock forward by `nanos`.
    pub fn advance(&self, nanos: u64) {
        self.now_ns.fetch_add(nanos, Ordering::AcqRel);
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::at_secs(1_000)
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Deadline {
        Deadline::from_nanos(self.now_ns.load(Ordering::Acquire))
    }

    fn sleep_until(&self, deadline: Deadline) {
        self.now_ns.fetch_max(deadline.as_nanos(), Ordering::AcqRel);
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_sleep_advances_to_deadline() {
        let clock = SimulatedClock::at_secs(10);
        let deadline = Deadline::new(15, 150_000);
        clock.sleep_until(deadline);
        assert_eq!(clock.now(), deadline);
    }

    #[test]
    fn test_simulated_never_goes_back() {
        let clock = SimulatedClock::at_secs(10);
        clock.sleep_until(Deadline::new(9, 0));
        assert_eq!(clock.now(), Deadline::new(10, 0));

        clock.advance(1_500_000_000);
        assert_eq!(clock.now(), Deadline::new(11, 500_000_000));
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock::new(ClockSource::Monotonic);
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!((0..NSEC_PER_SEC).contains(&a.nsec));
    }

    #[test]
    fn test_system_clock_sleep_until_past_returns() {
        let clock = SystemClock::new(ClockSource::Monotonic);
        let now = clock.now();
        clock.sleep_until(Deadline::new(now.sec - 1, now.nsec));
    }

    #[test]
    fn test_system_clock_sleeps_to_deadline() {
        let clock = SystemClock::new(ClockSource::Monotonic);
        let mut deadline = clock.now();
        deadline.add_nanos(2_000_000);
        clock.sleep_until(deadline);
        assert!(clock.now() >= deadline);
    }
}
