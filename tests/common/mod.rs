//! Shared helpers for workspace-level tests.

#![allow(dead_code)] // Not every test binary uses every helper

use std::sync::Arc;
use std::time::{Duration, Instant};
use tsn_common::config::ExecutiveConfig;
use tsn_runtime::clock::{Clock, SimulatedClock};

/// Simulated time at which every test run starts.
pub const ORIGIN_SECS: u64 = 1_000;

/// 1 ms cycle with real-time setup disabled, suitable for unprivileged runs.
pub fn unprivileged_config() -> ExecutiveConfig {
    let mut config = ExecutiveConfig {
        cycle_time_ms: 1.0,
        ..Default::default()
    };
    config.network.interface = Some("lo".into());
    config.realtime.enabled = false;
    config
}

/// A simulated clock as the trait object the executive expects.
pub fn simulated_clock() -> Arc<dyn Clock> {
    Arc::new(SimulatedClock::at_secs(ORIGIN_SECS))
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
