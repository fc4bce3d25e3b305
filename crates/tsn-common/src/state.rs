//! Executive lifecycle state and the shared running flag.
//!
//! State transitions:
//! CONFIGURED → SPAWNING → RUNNING → DRAINING → STOPPED
//!
//! A failure while spawning role threads moves to FAULT, from which only
//! STOPPED is reachable once every spawned thread has been released and joined.

use crate::error::{RtError, RtResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle states of the cyclic executive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutiveState {
    /// Configuration validated, nothing spawned yet.
    #[default]
    Configured,
    /// Role threads are being created and bound to their cores.
    Spawning,
    /// All role threads released into their cyclic loops.
    Running,
    /// Running flag cleared; waiting for role threads to finish their cycle.
    Draining,
    /// Every role thread joined.
    Stopped,
    /// Setup failed before any role was released.
    Fault,
}

impl fmt::Display for ExecutiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configured => write!(f, "CONFIGURED"),
            Self::Spawning => write!(f, "SPAWNING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Fault => write!(f, "FAULT"),
        }
    }
}

impl ExecutiveState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ExecutiveState) -> bool {
        use ExecutiveState::{Configured, Draining, Fault, Running, Spawning, Stopped};

        matches!(
            (self, target),
            (Configured, Spawning)
                | (Spawning, Running)
                | (Running, Draining)
                | (Draining, Stopped)
                | (Configured, Fault)
                | (Spawning, Fault)
                | (Fault, Stopped)
                // Shutdown requested before the roles were released
                | (Spawning, Draining)
        )
    }

    /// Returns true once no role thread can still be running.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: ExecutiveState,
    previous: Option<ExecutiveState>,
    transition_count: u64,
}

impl StateMachine {
    /// Create a new state machine starting in CONFIGURED.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ExecutiveState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<ExecutiveState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    pub fn transition(&mut self, target: ExecutiveState) -> RtResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(RtError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }
}

/// Process-wide running flag, passed explicitly to every role.
///
/// Cleared by the signal path or by a full measurement record; never set
/// back once cleared. Each role polls it once per cycle.
#[derive(Debug, Clone)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    /// Create a flag in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the roles should keep cycling.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask every role to stop after its current cycle.
    #[inline]
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
