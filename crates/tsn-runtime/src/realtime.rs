//! Real-time scheduling and memory locking utilities.
//!
//! Two levels of setup:
//! - Process level, once before any role thread exists: memory locking
//!   (mlockall).
//! - Thread level, from inside each role thread before its first cycle:
//!   SCHED_FIFO/SCHED_RR priority and single-core affinity, then stack
//!   pre-faulting. Priority and affinity must succeed; a role never runs with
//!   a degraded priority or on the wrong core.

#![allow(unused_imports)] // Platform-specific code may not use all imports

use tsn_common::config::{RealtimeConfig, SchedPolicy};
use tsn_common::error::{RtError, RtResult};
use tracing::{debug, error, info, warn};

/// Result of process-level real-time initialization.
#[derive(Debug, Clone, Default)]
pub struct RealtimeStatus {
    /// Whether memory was locked successfully.
    pub memory_locked: bool,
}

/// Lock memory before role threads are created.
///
/// # Errors
///
/// Returns an error if `fail_fast` is set and the capability check fails, or
/// if `mlockall` fails for a reason other than missing privileges.
pub fn init_process_realtime(config: &RealtimeConfig) -> RtResult<RealtimeStatus> {
    if !config.enabled {
        info!("Real-time scheduling disabled in configuration");
        return Ok(RealtimeStatus::default());
    }

    if config.fail_fast {
        info!("Validating real-time capabilities (fail_fast=true)");
        validate_rt_capabilities(config)?;
    }

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };

    let status = RealtimeStatus { memory_locked };
    info!(?status, "Process real-time setup complete");
    Ok(status)
}

/// Run the calling thread under `policy` at `priority`, pinned to `core`.
///
/// Called from inside a freshly spawned role thread.
///
/// # Errors
///
/// Any failure is returned as [`RtError::Realtime`]; there is no fallback to
/// normal scheduling.
pub fn apply_thread_realtime(policy: SchedPolicy, priority: u8, core: usize) -> RtResult<()> {
    set_thread_priority(policy, priority)?;
    set_thread_affinity(core)?;
    debug!(?policy, priority, core, "Role thread bound");
    Ok(())
}

/// Lock all current and future memory pages.
#[cfg(target_os = "linux")]
fn lock_memory() -> RtResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    debug!("Locking memory pages with mlockall");

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked successfully");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!(
                "mlockall failed with EPERM - running without CAP_IPC_LOCK capability. \
                 Page faults may occur during execution."
            );
            Ok(false)
        }
        Err(e) => Err(RtError::Realtime(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> RtResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Touch up to `size` bytes of the calling thread's stack so the pages are
/// resident before its first cycle. Returns the bytes touched, capped at 1 MiB.
pub fn prefault_stack(size: usize) -> usize {
    if size == 0 {
        return 0;
    }

    debug!(size, "Pre-faulting stack pages");
    let total = prefault_stack_recursive(size, 0);
    debug!(total, "Stack pre-fault complete");
    total
}

#[inline(never)]
fn prefault_stack_recursive(remaining: usize, depth: usize) -> usize {
    const FRAME_SIZE: usize = 4096;
    // Stays well inside the default 2 MiB thread stack.
    const MAX_DEPTH: usize = 256;

    if remaining < FRAME_SIZE || depth >= MAX_DEPTH {
        return 0;
    }

    let mut buffer = [0u8; FRAME_SIZE];
    // SAFETY: writes stay inside our own stack buffer.
    unsafe {
        std::ptr::write_volatile(buffer.as_mut_ptr(), 0xBB);
        std::ptr::write_volatile(buffer.as_mut_ptr().add(FRAME_SIZE - 1), 0xCC);
    }
    std::hint::black_box(&buffer);

    FRAME_SIZE + prefault_stack_recursive(remaining - FRAME_SIZE, depth + 1)
}

#[cfg(target_os = "linux")]
fn set_thread_priority(policy: SchedPolicy, priority: u8) -> RtResult<()> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
    };

    if !(1..=99).contains(&priority) {
        return Err(RtError::Realtime(format!(
            "priority {priority} outside 1-99"
        )));
    }

    let param = libc::sched_param {
        sched_priority: i32::from(priority),
    };

    // SAFETY: pthread_self() is always a valid handle for the calling thread
    // and `param` outlives the call.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), linux_policy, &param) };

    if rc != 0 {
        let err = std::io::Error::from_raw_os_error(rc);
        let hint = if rc == libc::EPERM {
            " (grant CAP_SYS_NICE or raise RLIMIT_RTPRIO)"
        } else {
            ""
        };
        return Err(RtError::Realtime(format!(
            "pthread_setschedparam({policy:?}, {priority}) failed: {err}{hint}"
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_thread_priority(policy: SchedPolicy, priority: u8) -> RtResult<()> {
    Err(RtError::Realtime(format!(
        "{policy:?} priority {priority} not available on this platform"
    )))
}

#[cfg(target_os = "linux")]
fn set_thread_affinity(core: usize) -> RtResult<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core)
        .map_err(|e| RtError::Realtime(format!("invalid CPU index {core}: {e}")))?;

    // Pid 0 is the calling thread.
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|e| RtError::Realtime(format!("sched_setaffinity(core {core}) failed: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn set_thread_affinity(core: usize) -> RtResult<()> {
    Err(RtError::Realtime(format!(
        "CPU affinity (core {core}) not available on this platform"
    )))
}

/// Check if the current process has real-time capabilities.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    // SAFETY: geteuid has no preconditions.
    let mut caps = RtCapabilities {
        is_root: unsafe { libc::geteuid() } == 0,
        ..Default::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid out-pointer.
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }
    // SAFETY: as above.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }

    if let Ok(version) = std::fs::read_to_string("/proc/version") {
        caps.preempt_rt = version.contains("PREEMPT_RT") || version.contains("PREEMPT RT");
    }

    caps
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Information about real-time capabilities of the system.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Whether running as root.
    pub is_root: bool,
    /// RLIMIT_RTPRIO value (max RT priority allowed).
    pub rtprio_limit: Option<u64>,
    /// RLIMIT_MEMLOCK value (max lockable memory).
    pub memlock_limit: Option<u64>,
    /// Whether running on a PREEMPT_RT kernel.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Check if RT scheduling is likely to succeed.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// Check if memory locking is likely to succeed.
    #[must_use]
    pub fn can_lock_memory(&self) -> bool {
        if self.is_root {
            return true;
        }

        #[cfg(target_family = "unix")]
        {
            self.memlock_limit.is_some_and(|l| l == libc::RLIM_INFINITY)
        }

        #[cfg(not(target_family = "unix"))]
        {
            false
        }
    }
}

/// Validate that real-time capabilities are available.
///
/// # Errors
///
/// Returns an error naming every requirement that is not met.
pub fn validate_rt_capabilities(config: &RealtimeConfig) -> RtResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let caps = check_rt_capabilities();
    let mut issues = Vec::new();

    if !caps.preempt_rt {
        warn!(
            "PREEMPT_RT kernel not detected. Wake-up jitter may exceed the cycle budget; \
             use a PREEMPT_RT kernel for TSN deployments."
        );
    }

    if !caps.can_use_rt_scheduling() {
        issues.push(format!(
            "Cannot use RT scheduling (SCHED_{:?}): RLIMIT_RTPRIO={:?}, is_root={}. \
             Grant CAP_SYS_NICE capability or set RLIMIT_RTPRIO > 0.",
            config.policy, caps.rtprio_limit, caps.is_root
        ));
    }

    if config.lock_memory && !caps.can_lock_memory() {
        issues.push(format!(
            "Cannot lock memory: RLIMIT_MEMLOCK={:?}, is_root={}. \
             Grant CAP_IPC_LOCK capability or set RLIMIT_MEMLOCK to unlimited.",
            caps.memlock_limit, caps.is_root
        ));
    }

    if issues.is_empty() {
        info!("Real-time capabilities validated successfully");
        Ok(())
    } else {
        let message = format!(
            "Real-time requirements not met (fail_fast=true):\n  - {}",
            issues.join("\n  - ")
        );
        error!("{}", message);
        Err(RtError::Realtime(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_rt() {
        let config = RealtimeConfig {
            enabled: false,
            ..Default::default()
        };

        let status = init_process_realtime(&config).unwrap();
        assert!(!status.memory_locked);
    }

    #[test]
    fn test_stack_prefault() {
        let faulted = prefault_stack(64 * 1024);
        assert_eq!(faulted, 64 * 1024);
        assert_eq!(prefault_stack(0), 0);
    }

    #[test]
    fn test_stack_prefault_on_spawned_thread() {
        let faulted = std::thread::spawn(|| prefault_stack(8 * 1024 * 1024))
            .join()
            .unwrap();
        assert_eq!(faulted, 1024 * 1024);
    }

    #[test]
    fn test_rt_capabilities() {
        let caps = check_rt_capabilities();
        let _ = caps.can_use_rt_scheduling();
        let _ = caps.can_lock_memory();
    }

    #[test]
    fn test_disabled_config_skips_validation() {
        let config = RealtimeConfig {
            enabled: false,
            fail_fast: true,
            ..Default::default()
        };
        assert!(validate_rt_capabilities(&config).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bad_core_is_fatal() {
        // Run in a scratch thread so a partial success cannot leak into the test runner.
        let result = std::thread::spawn(|| set_thread_affinity(usize::MAX))
            .join()
            .unwrap();
        assert!(matches!(result, Err(RtError::Realtime(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bad_priority_is_fatal() {
        let result = std::thread::spawn(|| apply_thread_realtime(SchedPolicy::Fifo, 0, 0))
            .join()
            .unwrap();
        assert!(matches!(result, Err(RtError::Realtime(_))));
    }
}
