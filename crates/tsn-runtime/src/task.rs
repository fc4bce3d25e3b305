//! Periodic task runner.
//!
//! Every role runs the same loop on its own thread:
//! 1. Poll the running flag
//! 2. Sleep until the absolute deadline
//! 3. Fire the payload once
//! 4. Advance the deadline by one period and normalize
//!
//! Deadlines are derived from the previous deadline and never from the time
//! the thread actually woke, so late wake-ups do not accumulate drift.

use crate::clock::Clock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tsn_common::config::RoleConfig;
use tsn_common::metrics::{WakeupMetrics, WakeupSnapshot};
use tsn_common::state::RunFlag;
use tsn_common::time::{phase_offset_ns, Deadline};

/// Wake-up latency samples retained per role.
const WAKEUP_HISTOGRAM_SIZE: usize = 4096;

/// When a task wakes inside each cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskTiming {
    /// Fraction of the period at which the task wakes, in `[0, 1)`.
    pub phase: f64,
    /// Cycle period in nanoseconds.
    pub period_ns: u64,
    /// Delay between reading the clock and the first wake-up.
    pub start_delay: Duration,
}

impl TaskTiming {
    /// Timing for a role from its configuration.
    #[must_use]
    pub fn for_role(role: &RoleConfig, period_ns: u64, start_delay: Duration) -> Self {
        Self {
            phase: role.wakeup_fraction,
            period_ns,
            start_delay,
        }
    }

    /// Offset of the wake-up inside the cycle, in nanoseconds.
    #[must_use]
    pub fn phase_offset_ns(&self) -> u64 {
        phase_offset_ns(self.period_ns, self.phase)
    }
}

/// First wake-up: `t0 + start_delay`, with the sub-second part replaced by
/// the phase offset.
///
/// Every role shares the whole-second origin, so their deadlines line up on
/// the same cycle grid. Fractional seconds in `start_delay` are dropped.
#[must_use]
pub fn first_deadline(t0: Deadline, timing: &TaskTiming) -> Deadline {
    let mut next = t0;
    next.add_secs(timing.start_delay.as_secs());
    next.with_subsec_nanos(timing.phase_offset_ns())
}

/// One invocation of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Zero-based cycle index.
    pub cycle: u64,
    /// Deadline this invocation was scheduled for.
    pub deadline: Deadline,
    /// Clock reading on wake-up.
    pub now: Deadline,
}

/// Summary of a finished task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    /// Task name.
    pub name: String,
    /// Payload invocations.
    pub cycles: u64,
    /// First scheduled deadline.
    pub first_deadline: Option<Deadline>,
    /// Last fired deadline.
    pub last_deadline: Option<Deadline>,
    /// Wake-up latency statistics.
    pub wakeup: WakeupSnapshot,
}

/// Absolute-deadline periodic loop bound to one clock and one running flag.
pub struct PeriodicTask<C: Clock + ?Sized> {
    name: String,
    timing: TaskTiming,
    clock: Arc<C>,
    run_flag: RunFlag,
    cycle_limit: Option<u64>,
    origin: Option<Deadline>,
    metrics: WakeupMetrics,
}

impl<C: Clock + ?Sized> PeriodicTask<C> {
    /// Create a task; nothing runs until [`run`](Self::run).
    pub fn new(name: impl Into<String>, timing: TaskTiming, clock: Arc<C>, run_flag: RunFlag) -> Self {
        let metrics = WakeupMetrics::new(
            WAKEUP_HISTOGRAM_SIZE,
            Duration::from_nanos(timing.period_ns),
        );
        Self {
            name: name.into(),
            timing,
            clock,
            run_flag,
            cycle_limit: None,
            origin: None,
            metrics,
        }
    }

    /// Stop after `limit` invocations even if the running flag stays set.
    #[must_use]
    pub fn with_cycle_limit(mut self, limit: Option<u64>) -> Self {
        self.cycle_limit = limit;
        self
    }

    /// Use `t0` instead of reading the clock when the loop starts.
    ///
    /// Tasks sharing one origin share one cycle grid even if their threads
    /// start on different sides of a second boundary.
    #[must_use]
    pub fn with_origin(mut self, t0: Deadline) -> Self {
        self.origin = Some(t0);
        self
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until the running flag is cleared or the cycle limit is reached.
    ///
    /// The flag is checked once per iteration, before the wait; a stop request
    /// made while sleeping lets that cycle's payload run before the loop exits.
    pub fn run<F>(mut self, mut payload: F) -> TaskReport
    where
        F: FnMut(Tick),
    {
        let t0 = self.origin.unwrap_or_else(|| self.clock.now());
        let first = first_deadline(t0, &self.timing);
        let mut next = first;
        let mut cycle = 0u64;
        let mut last = None;

        info!(
            task = %self.name,
            first_deadline = %first,
            period_ns = self.timing.period_ns,
            phase = self.timing.phase,
            "Entering cyclic loop"
        );

        while self.run_flag.is_running() && self.cycle_limit.map_or(true, |limit| cycle < limit) {
            self.clock.sleep_until(next);

            let now = self.clock.now();
            self.metrics.record_ns(now.nanos_since(next));

            payload(Tick {
                cycle,
                deadline: next,
                now,
            });

            last = Some(next);
            cycle += 1;
            next.add_nanos(self.timing.period_ns);
        }

        debug!(task = %self.name, cycles = cycle, "Cyclic loop exited");

        TaskReport {
            name: self.name,
            cycles: cycle,
            first_deadline: Some(first),
            last_deadline: last,
            wakeup: self.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use tsn_common::time::NSEC_PER_SEC;

    fn timing(phase: f64, period_ns: u64) -> TaskTiming {
        TaskTiming {
            phase,
            period_ns,
            start_delay: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_first_deadline_aligns_phase() {
        let t0 = Deadline::new(100, 734_221_001);
        assert_eq!(
            first_deadline(t0, &timing(0.6, 250_000)),
            Deadline::new(105, 150_000)
        );
        assert_eq!(
            first_deadline(t0, &timing(0.0, 250_000)),
            Deadline::new(105, 0)
        );
    }

    #[test]
    fn test_kth_deadline_is_exact() {
        let clock = Arc::new(SimulatedClock::at_secs(50));
        let task = PeriodicTask::new("t", timing(0.3, 1_000_000), clock, RunFlag::new())
            .with_cycle_limit(Some(2_500));

        let mut deadlines = Vec::new();
        let report = task.run(|tick| deadlines.push(tick.deadline));

        assert_eq!(report.cycles, 2_500);
        let next0 = deadlines[0];
        assert_eq!(next0, Deadline::new(55, 300_000));
        for (k, d) in deadlines.iter().enumerate() {
            let mut expected = next0;
            expected.add_nanos(k as u64 * 1_000_000);
            assert_eq!(*d, expected, "cycle {k}");
            assert!((0..NSEC_PER_SEC).contains(&d.nsec));
        }
        // 2 500 ms of cycles cross two second boundaries.
        assert_eq!(report.last_deadline, Some(Deadline::new(57, 499_300_000)));
    }

    #[test]
    fn test_stops_when_flag_cleared() {
        let clock = Arc::new(SimulatedClock::at_secs(1));
        let flag = RunFlag::new();
        let stopper = flag.clone();
        let task = PeriodicTask::new("t", timing(0.0, 250_000), clock, flag);

        let report = task.run(|tick| {
            if tick.cycle == 9 {
                stopper.request_stop();
            }
        });
        assert_eq!(report.cycles, 10);
    }

    #[test]
    fn test_cleared_flag_runs_nothing() {
        let flag = RunFlag::new();
        flag.request_stop();
        let task = PeriodicTask::new("t", timing(0.0, 250_000), Arc::new(SimulatedClock::default()), flag);

        let mut fired = 0;
        let report = task.run(|_| fired += 1);
        assert_eq!(fired, 0);
        assert_eq!(report.cycles, 0);
        assert!(report.last_deadline.is_none());
    }

    #[test]
    fn test_simulated_wakeups_have_zero_latency() {
        let clock = Arc::new(SimulatedClock::default());
        let report = PeriodicTask::new("t", timing(0.5, 500_000), clock, RunFlag::new())
            .with_cycle_limit(Some(20))
            .run(|tick| assert_eq!(tick.now, tick.deadline));

        assert_eq!(report.wakeup.total_wakeups, 20);
        assert_eq!(report.wakeup.max_ns, Some(0));
        assert_eq!(report.wakeup.missed_count, 0);
    }

    #[test]
    fn test_shared_origin_ignores_clock() {
        let clock = Arc::new(SimulatedClock::at_secs(900));
        let report = PeriodicTask::new("t", timing(0.0, 1_000_000), clock, RunFlag::new())
            .with_origin(Deadline::new(10, 999_999_999))
            .with_cycle_limit(Some(1))
            .run(|_| {});

        assert_eq!(report.first_deadline, Some(Deadline::new(15, 0)));
        // The deadline was already in the past: the wake-up is a full cycle late or more.
        assert_eq!(report.wakeup.missed_count, 1);
    }
}
