//! Role thread lifecycle and the cyclic executive.
//!
//! Startup runs in two phases so that no role produces anything unless every
//! role could be bound to its priority and core:
//!
//! 1. **Spawn**: each role thread starts, applies its real-time binding, and
//!    reports the outcome back over a handshake channel. It then parks.
//! 2. **Release**: once all three reported success, the controller releases
//!    them into their cyclic loops.
//!
//! If any binding fails the parked threads are dismissed without running a
//! single cycle, joined, and the error is returned.

use crate::clock::Clock;
use crate::measurement::MeasurementRecord;
use crate::realtime::{apply_thread_realtime, init_process_realtime, prefault_stack};
use crate::roles::{ConsumerRole, MeasurementLogs, ProducerRole, Role, UserLogicRole};
use crate::task::{PeriodicTask, TaskReport, TaskTiming};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tsn_common::config::{ExecutiveConfig, RealtimeConfig, RoleConfig, SchedPolicy};
use tsn_common::counters::{counter_bank, BankReader};
use tsn_common::error::{RtError, RtResult};
use tsn_common::state::{ExecutiveState, RunFlag, StateMachine};
use tsn_transport::{GroupId, Transport};

/// Priority and core a role thread binds itself to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadBinding {
    /// Scheduler policy.
    pub policy: SchedPolicy,
    /// Real-time priority (1-99).
    pub priority: u8,
    /// CPU core index.
    pub core: usize,
    /// Stack bytes to touch once bound.
    pub prefault_stack_size: usize,
}

impl ThreadBinding {
    /// Binding for `role` under the process-wide real-time settings.
    #[must_use]
    pub fn for_role(realtime: &RealtimeConfig, role: &RoleConfig) -> Self {
        Self {
            policy: realtime.policy,
            priority: role.priority,
            core: role.core,
            prefault_stack_size: realtime.prefault_stack_size,
        }
    }

    /// Bind the calling thread, then pre-fault its stack.
    ///
    /// Returns the number of stack bytes touched. Nothing is pre-faulted when
    /// priority or affinity is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::Realtime`] if priority or affinity cannot be applied.
    pub fn apply(&self) -> RtResult<usize> {
        apply_thread_realtime(self.policy, self.priority, self.core)?;
        Ok(prefault_stack(self.prefault_stack_size))
    }
}

/// What a role thread hands back when it is joined.
#[derive(Debug)]
pub struct RoleExit {
    /// Which role finished.
    pub role: Role,
    /// Loop summary.
    pub report: TaskReport,
    /// Measurement records (user logic only).
    pub logs: Option<MeasurementLogs>,
}

/// Entry point of a role thread, run once after release.
pub type RoleBody = Box<dyn FnOnce() -> RoleExit + Send + 'static>;

struct RoleThread {
    role: Role,
    release: Option<mpsc::Sender<()>>,
    handle: JoinHandle<Option<RoleExit>>,
}

/// Spawns, releases, and joins role threads.
pub struct Controller {
    run_flag: RunFlag,
    threads: Vec<RoleThread>,
    state: StateMachine,
}

impl Controller {
    /// Create a controller driving `run_flag`.
    #[must_use]
    pub fn new(run_flag: RunFlag) -> Self {
        Self {
            run_flag,
            threads: Vec::with_capacity(Role::ALL.len()),
            state: StateMachine::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ExecutiveState {
        self.state.state()
    }

    /// Start a role thread and wait until it is bound.
    ///
    /// The thread applies `binding` (if any) to itself, then waits for
    /// [`release`](Self::release) before running `body`.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::Spawn`] if the OS thread cannot be created and
    /// [`RtError::Realtime`] if the binding is rejected. The controller is
    /// left in FAULT; call [`abort`](Self::abort) to join what was spawned.
    pub fn spawn(
        &mut self,
        role: Role,
        binding: Option<ThreadBinding>,
        body: RoleBody,
    ) -> RtResult<()> {
        if self.state.state() == ExecutiveState::Configured {
            self.state.transition(ExecutiveState::Spawning)?;
        }

        let (ready_tx, ready_rx) = mpsc::channel::<RtResult<()>>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name(role.thread_name().to_string())
            .spawn(move || {
                let bound = match binding {
                    Some(b) => b.apply().map(|faulted| {
                        debug!(%role, stack_prefaulted = faulted, "Role thread stack pre-faulted");
                    }),
                    None => Ok(()),
                };
                let ok = bound.is_ok();
                // The controller may already have given up on us.
                let _ = ready_tx.send(bound);
                if !ok || release_rx.recv().is_err() {
                    return None;
                }
                Some(body())
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.fault();
                return Err(RtError::Spawn {
                    name: role.thread_name().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let outcome = ready_rx.recv().unwrap_or_else(|_| {
            Err(RtError::Spawn {
                name: role.thread_name().to_string(),
                reason: "thread exited before reporting readiness".into(),
            })
        });

        self.threads.push(RoleThread {
            role,
            release: Some(release_tx),
            handle,
        });

        match outcome {
            Ok(()) => {
                debug!(%role, ?binding, "Role thread ready");
                Ok(())
            }
            Err(e) => {
                error!(%role, error = %e, "Role thread setup failed");
                self.fault();
                Err(e)
            }
        }
    }

    /// Let every spawned thread enter its cyclic loop.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside SPAWNING.
    pub fn release(&mut self) -> RtResult<()> {
        self.state.transition(ExecutiveState::Running)?;
        for thread in &mut self.threads {
            if let Some(tx) = thread.release.take() {
                // A send only fails if the thread already exited.
                let _ = tx.send(());
            }
        }
        info!(roles = self.threads.len(), "Role threads released");
        Ok(())
    }

    /// Whether every spawned thread has returned.
    #[must_use]
    pub fn all_finished(&self) -> bool {
        self.threads.iter().all(|t| t.handle.is_finished())
    }

    /// Clear the running flag and join every thread.
    ///
    /// A thread that panicked is reported with a warning and skipped.
    pub fn shutdown(&mut self) -> Vec<RoleExit> {
        self.run_flag.request_stop();
        if matches!(
            self.state.state(),
            ExecutiveState::Running | ExecutiveState::Spawning
        ) {
            let _ = self.state.transition(ExecutiveState::Draining);
        }

        let mut exits = Vec::with_capacity(self.threads.len());
        for thread in self.threads.drain(..) {
            // Dismiss threads that were never released.
            drop(thread.release);
            match thread.handle.join() {
                Ok(Some(exit)) => exits.push(exit),
                Ok(None) => debug!(role = %thread.role, "Role thread dismissed before release"),
                Err(_) => warn!(role = %thread.role, "Failed to join role thread"),
            }
        }

        let _ = self.state.transition(ExecutiveState::Stopped);
        info!(joined = exits.len(), "Role threads joined");
        exits
    }

    /// Join everything after a failed spawn. No role has run a cycle.
    pub fn abort(&mut self) {
        self.fault();
        let _ = self.shutdown();
    }

    fn fault(&mut self) {
        if !matches!(
            self.state.state(),
            ExecutiveState::Fault | ExecutiveState::Stopped
        ) {
            let _ = self.state.transition(ExecutiveState::Fault);
        }
    }
}

/// Builder for the cyclic executive.
pub struct CyclicExecutive {
    config: ExecutiveConfig,
    cycle_limit: Option<u64>,
    run_flag: RunFlag,
}

impl CyclicExecutive {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: ExecutiveConfig) -> Self {
        Self {
            config,
            cycle_limit: None,
            run_flag: RunFlag::new(),
        }
    }

    /// Stop each role after `limit` cycles.
    #[must_use]
    pub fn cycle_limit(mut self, limit: Option<u64>) -> Self {
        self.cycle_limit = limit;
        self
    }

    /// Drive the executive with an externally owned running flag.
    #[must_use]
    pub fn run_flag(mut self, flag: RunFlag) -> Self {
        self.run_flag = flag;
        self
    }

    /// Validate, register transport groups, spawn and release the roles.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, transport registration failure, or any
    /// role failing its real-time binding. On error nothing has produced and
    /// every registered group has been removed again.
    pub fn launch<T: Transport>(
        self,
        mut transport: T,
        clock: Arc<dyn Clock>,
    ) -> RtResult<RunningExecutive<T>> {
        let config = self.config;
        config.validate()?;
        if !config.phase_order_is_consistent() {
            warn!(
                user_logic = config.user_logic.wakeup_fraction,
                producer = config.producer.wakeup_fraction,
                "User logic wakes after the producer; frames carry the previous cycle's counters"
            );
        }

        init_process_realtime(&config.realtime)?;

        let writer_group = GroupId(config.network.writer_group_id);
        let reader_group = GroupId(config.network.reader_group_id);
        let publisher = transport.register_writer_group(writer_group)?;
        let subscriber = match transport.register_reader_group(reader_group) {
            Ok(s) => s,
            Err(e) => {
                unregister_quietly(&mut transport, writer_group);
                return Err(e);
            }
        };

        let counters = config.counter_count();
        let (producer_writer, producer_reader) = counter_bank("producer", counters);
        let (consumer_writer, consumer_reader) = counter_bank("consumer", counters);

        let period_ns = config.period_ns();
        let logs = config.measurement.enabled.then(|| MeasurementLogs {
            publisher: MeasurementRecord::new(
                "publisher",
                config.measurement.capacity,
                self.run_flag.clone(),
            ),
            subscriber: MeasurementRecord::new(
                "subscriber",
                config.measurement.capacity,
                self.run_flag.clone(),
            ),
        });

        let mut producer = ProducerRole::new(
            producer_reader.clone(),
            publisher,
            period_ns,
            config.producer.wakeup_fraction,
            config.transmit_offset_ns(),
            config.network.txtime_enabled,
        );
        let mut consumer = ConsumerRole::new(subscriber, consumer_writer);
        let mut user_logic = UserLogicRole::new(
            producer_writer,
            consumer_reader.clone(),
            config.repeated_initial,
            Arc::clone(&clock),
            logs,
        );

        let origin = clock.now();
        let task = |role: Role, cfg: &RoleConfig| {
            PeriodicTask::new(
                role.to_string(),
                TaskTiming::for_role(cfg, period_ns, config.start_delay),
                Arc::clone(&clock),
                self.run_flag.clone(),
            )
            .with_origin(origin)
            .with_cycle_limit(self.cycle_limit)
        };
        let producer_task = task(Role::Producer, &config.producer);
        let consumer_task = task(Role::Consumer, &config.consumer);
        let user_task = task(Role::UserLogic, &config.user_logic);

        let binding = |cfg: &RoleConfig| {
            config
                .realtime
                .enabled
                .then(|| ThreadBinding::for_role(&config.realtime, cfg))
        };

        let bodies: [(Role, Option<ThreadBinding>, RoleBody); 3] = [
            (
                Role::Consumer,
                binding(&config.consumer),
                Box::new(move || RoleExit {
                    role: Role::Consumer,
                    report: consumer_task.run(|tick| consumer.fire(tick)),
                    logs: None,
                }),
            ),
            (
                Role::Producer,
                binding(&config.producer),
                Box::new(move || RoleExit {
                    role: Role::Producer,
                    report: producer_task.run(|tick| producer.fire(tick)),
                    logs: None,
                }),
            ),
            (
                Role::UserLogic,
                binding(&config.user_logic),
                Box::new(move || {
                    let report = user_task.run(|tick| user_logic.fire(tick));
                    RoleExit {
                        role: Role::UserLogic,
                        report,
                        logs: user_logic.into_logs(),
                    }
                }),
            ),
        ];

        let mut controller = Controller::new(self.run_flag.clone());
        for (role, binding, body) in bodies {
            if let Err(e) = controller.spawn(role, binding, body) {
                controller.abort();
                unregister_quietly(&mut transport, writer_group);
                unregister_quietly(&mut transport, reader_group);
                return Err(e);
            }
        }
        controller.release()?;

        info!(
            period_ns,
            origin = %origin,
            start_delay = ?config.start_delay,
            "Cyclic executive running"
        );

        Ok(RunningExecutive {
            controller,
            transport,
            groups: [writer_group, reader_group],
            run_flag: self.run_flag,
            producer_counters: producer_reader,
            consumer_counters: consumer_reader,
        })
    }
}

fn unregister_quietly<T: Transport>(transport: &mut T, id: GroupId) {
    if let Err(e) = transport.unregister(id) {
        warn!(%id, error = %e, "Failed to unregister group");
    }
}

/// A launched executive; dropping it without [`shutdown`](Self::shutdown)
/// leaves the role threads detached.
pub struct RunningExecutive<T: Transport> {
    controller: Controller,
    transport: T,
    groups: [GroupId; 2],
    run_flag: RunFlag,
    producer_counters: BankReader,
    consumer_counters: BankReader,
}

impl<T: Transport> RunningExecutive<T> {
    /// Handle for requesting shutdown from outside (signals, tests).
    #[must_use]
    pub fn run_flag(&self) -> RunFlag {
        self.run_flag.clone()
    }

    /// Read access to the producer counters.
    #[must_use]
    pub fn producer_counters(&self) -> &BankReader {
        &self.producer_counters
    }

    /// Read access to the consumer counters.
    #[must_use]
    pub fn consumer_counters(&self) -> &BankReader {
        &self.consumer_counters
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ExecutiveState {
        self.controller.state()
    }

    /// Block until the running flag is cleared or every role has finished.
    pub fn wait(&self, poll: Duration) {
        while self.run_flag.is_running() && !self.controller.all_finished() {
            thread::sleep(poll);
        }
    }

    /// Stop the roles, join them, and remove the transport groups.
    pub fn shutdown(mut self) -> ExecutiveReport {
        info!("Shutting down cyclic executive");
        let exits = self.controller.shutdown();

        for id in self.groups {
            unregister_quietly(&mut self.transport, id);
        }

        let mut report = ExecutiveReport {
            tasks: Vec::with_capacity(exits.len()),
            logs: None,
            producer_final: self.producer_counters.snapshot().as_slice().to_vec(),
            consumer_final: self.consumer_counters.snapshot().as_slice().to_vec(),
        };
        for exit in exits {
            if exit.logs.is_some() {
                report.logs = exit.logs;
            }
            report.tasks.push((exit.role, exit.report));
        }
        report
    }
}

/// Everything the executive produced, available after shutdown.
#[derive(Debug)]
pub struct ExecutiveReport {
    /// Per-role loop summaries.
    pub tasks: Vec<(Role, TaskReport)>,
    /// Measurement records, if logging was enabled.
    pub logs: Option<MeasurementLogs>,
    /// Producer counters after the last cycle.
    pub producer_final: Vec<u64>,
    /// Consumer counters after the last cycle.
    pub consumer_final: Vec<u64>,
}

impl ExecutiveReport {
    /// Loop summary of `role`.
    #[must_use]
    pub fn task(&self, role: Role) -> Option<&TaskReport> {
        self.tasks.iter().find(|(r, _)| *r == role).map(|(_, t)| t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use tsn_transport::{LoopbackTransport, NullTransport};

    fn test_config() -> ExecutiveConfig {
        let mut config = ExecutiveConfig {
            cycle_time_ms: 1.0,
            ..Default::default()
        };
        config.realtime.enabled = false;
        config
    }

    fn trivial_body(role: Role) -> RoleBody {
        Box::new(move || RoleExit {
            role,
            report: TaskReport {
                name: role.to_string(),
                cycles: 0,
                first_deadline: None,
                last_deadline: None,
                wakeup: Default::default(),
            },
            logs: None,
        })
    }

    #[test]
    fn test_controller_lifecycle() {
        let flag = RunFlag::new();
        let mut controller = Controller::new(flag.clone());
        controller.spawn(Role::Consumer, None, trivial_body(Role::Consumer)).unwrap();
        controller.spawn(Role::Producer, None, trivial_body(Role::Producer)).unwrap();
        assert_eq!(controller.state(), ExecutiveState::Spawning);

        controller.release().unwrap();
        assert_eq!(controller.state(), ExecutiveState::Running);

        let exits = controller.shutdown();
        assert_eq!(exits.len(), 2);
        assert!(!flag.is_running());
        assert_eq!(controller.state(), ExecutiveState::Stopped);
    }

    #[test]
    fn test_binding_carries_stack_prefault() {
        let realtime = RealtimeConfig {
            policy: SchedPolicy::Rr,
            prefault_stack_size: 256 * 1024,
            ..Default::default()
        };
        let binding = ThreadBinding::for_role(&realtime, &RoleConfig::user_logic());
        assert_eq!(binding.policy, SchedPolicy::Rr);
        assert_eq!(binding.priority, 75);
        assert_eq!(binding.core, 3);
        assert_eq!(binding.prefault_stack_size, 256 * 1024);
    }

    #[test]
    fn test_rejected_binding_is_not_prefaulted() {
        let binding = ThreadBinding {
            policy: SchedPolicy::Fifo,
            priority: 100,
            core: 0,
            prefault_stack_size: 64 * 1024,
        };
        let result = thread::spawn(move || binding.apply()).join().unwrap();
        assert!(matches!(result, Err(RtError::Realtime(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_binding_runs_nothing() {
        let mut controller = Controller::new(RunFlag::new());
        controller.spawn(Role::Consumer, None, trivial_body(Role::Consumer)).unwrap();

        let bad = ThreadBinding {
            policy: SchedPolicy::Fifo,
            priority: 0,
            core: 0,
            prefault_stack_size: 64 * 1024,
        };
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result = controller.spawn(
            Role::Producer,
            Some(bad),
            Box::new(move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                trivial_body(Role::Producer)()
            }),
        );
        assert!(matches!(result, Err(RtError::Realtime(_))));
        assert_eq!(controller.state(), ExecutiveState::Fault);

        controller.abort();
        assert_eq!(controller.state(), ExecutiveState::Stopped);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_launch_rejects_short_cycle() {
        let config = ExecutiveConfig {
            cycle_time_ms: 0.1,
            ..test_config()
        };
        let result = CyclicExecutive::new(config)
            .launch(NullTransport::new(), Arc::new(SimulatedClock::default()));
        assert!(matches!(result, Err(RtError::InvalidCycleTime { .. })));
    }

    #[test]
    fn test_bounded_run() {
        let transport = LoopbackTransport::new();
        let probe = transport.probe();
        let exec = CyclicExecutive::new(test_config())
            .cycle_limit(Some(50))
            .launch(transport, Arc::new(SimulatedClock::default()))
            .unwrap();
        assert_eq!(exec.state(), ExecutiveState::Running);

        exec.wait(Duration::from_millis(1));
        let report = exec.shutdown();

        for role in Role::ALL {
            assert_eq!(report.task(role).unwrap().cycles, 50, "{role}");
        }
        assert_eq!(report.producer_final, vec![50, 60, 60]);
        assert_eq!(probe.stats().frames_sent, 50);
        assert!(report.logs.is_none());
    }

    #[test]
    fn test_reader_registration_failure_is_fatal() {
        let mut transport = NullTransport::new();
        // Pre-register the reader group so launch fails on it.
        transport.register_reader_group(GroupId(100)).unwrap();

        let result = CyclicExecutive::new(test_config())
            .launch(transport, Arc::new(SimulatedClock::default()));
        assert!(matches!(result, Err(RtError::Transport(_))));
    }
}
