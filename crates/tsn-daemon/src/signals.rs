//! Signal handling for graceful daemon shutdown.
//!
//! SIGINT and SIGTERM set a static flag from the async-signal-safe handler.
//! A forwarder thread turns that flag into a stop request on the executive's
//! [`RunFlag`]. Nothing else happens on a signal; the roles notice the cleared
//! flag at their next cycle.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use tsn_common::state::RunFlag;

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

const FORWARD_POLL: Duration = Duration::from_millis(10);

/// Signal types that stop the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
}

impl SignalKind {
    fn from_raw(signum: i32) -> Option<Self> {
        match signum {
            libc::SIGTERM => Some(Self::Terminate),
            libc::SIGINT => Some(Self::Interrupt),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Forwards SIGINT/SIGTERM to a [`RunFlag`].
pub struct SignalForwarder {
    run_flag: RunFlag,
}

impl SignalForwarder {
    /// Register the handlers and start the forwarder thread.
    ///
    /// The thread exits once `run_flag` is cleared, whatever cleared it.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be installed or the thread cannot
    /// be spawned.
    pub fn install(run_flag: RunFlag) -> std::io::Result<Self> {
        register_unix_handlers()?;

        let flag = run_flag.clone();
        std::thread::Builder::new()
            .name("tsn-signals".into())
            .spawn(move || forward(&flag))?;

        Ok(Self { run_flag })
    }

    /// Whether a stop has been requested (by a signal or otherwise).
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        !self.run_flag.is_running()
    }

    /// Signal that triggered shutdown, if any.
    #[must_use]
    pub fn received(&self) -> Option<SignalKind> {
        SignalKind::from_raw(LAST_SIGNAL.load(Ordering::Relaxed))
    }
}

fn forward(run_flag: &RunFlag) {
    while run_flag.is_running() {
        if SHUTDOWN_FLAG.swap(false, Ordering::AcqRel) {
            let signal = SignalKind::from_raw(LAST_SIGNAL.load(Ordering::Relaxed));
            info!(?signal, "Shutdown signal received");
            run_flag.request_stop();
            break;
        }
        std::thread::sleep(FORWARD_POLL);
    }
    debug!("Signal forwarder exiting");
}

extern "C" fn on_shutdown_signal(signum: libc::c_int) {
    LAST_SIGNAL.store(signum, Ordering::Relaxed);
    SHUTDOWN_FLAG.store(true, Ordering::Release);
}

fn register_unix_handlers() -> std::io::Result<()> {
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only touches atomics, which is async-signal-safe.
        let previous = unsafe { libc::signal(signum, on_shutdown_signal as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    debug!("Unix signal handlers registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(SignalKind::from_raw(libc::SIGINT), Some(SignalKind::Interrupt));
        assert_eq!(SignalKind::from_raw(libc::SIGHUP), None);
        assert_eq!(SignalKind::Terminate.to_string(), "SIGTERM");
    }

    #[test]
    fn test_raised_signal_clears_run_flag() {
        let flag = RunFlag::new();
        let forwarder = SignalForwarder::install(flag.clone()).unwrap();
        assert!(!forwarder.shutdown_requested());

        // SAFETY: our handler is installed, so SIGTERM does not terminate the process.
        unsafe {
            libc::raise(libc::SIGTERM);
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while flag.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(forwarder.shutdown_requested());
        assert_eq!(forwarder.received(), Some(SignalKind::Terminate));
    }
}
