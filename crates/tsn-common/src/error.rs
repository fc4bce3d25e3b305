use thiserror::Error;

/// Executive error types covering configuration, real-time setup, and transport failures.
///
/// Every variant is raised during setup or teardown. The cyclic hot path has no error path.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RtError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cycle time below the supported minimum.
    #[error("bad cycle time: {cycle_time_ms} ms (minimum {minimum_ms} ms)")]
    InvalidCycleTime {
        /// Requested cycle time in milliseconds.
        cycle_time_ms: f64,
        /// Smallest accepted cycle time in milliseconds.
        minimum_ms: f64,
    },

    /// Wake-phase fraction outside `[0, 1)`.
    #[error("invalid wakeup fraction {fraction} for {role}")]
    InvalidPhase {
        /// Role the fraction was configured for.
        role: String,
        /// Offending fraction.
        fraction: f64,
    },

    /// Real-time priority, affinity, or memory locking was rejected by the OS.
    #[error("real-time setup failed: {0}")]
    Realtime(String),

    /// A role thread could not be created.
    #[error("failed to spawn thread {name}: {reason}")]
    Spawn {
        /// Thread name.
        name: String,
        /// Underlying reason.
        reason: String,
    },

    /// Transport registration or teardown error.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl From<std::io::Error> for RtError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience type alias for executive operations.
pub type RtResult<T> = Result<T, RtError>;
