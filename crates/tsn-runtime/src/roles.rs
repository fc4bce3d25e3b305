//! Per-cycle payloads of the three roles.
//!
//! Each role owns exactly what it writes: the user logic owns the producer
//! bank writer, the consumer owns the consumer bank writer. Everything else
//! is a reader. A role's `fire` is the body of one cycle and has no error path.

use crate::clock::Clock;
use crate::measurement::MeasurementRecord;
use crate::task::Tick;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tsn_common::counters::{BankReader, BankWriter};
use tsn_common::time::transmission_time_ns;
use tsn_transport::{Publisher, Subscriber};

/// The three periodic roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Reads producer counters and hands them to the transport.
    Producer,
    /// Polls the transport and updates consumer counters.
    Consumer,
    /// Increments producer counters and records measurements.
    UserLogic,
}

impl Role {
    /// All roles in spawn order.
    pub const ALL: [Role; 3] = [Role::Consumer, Role::Producer, Role::UserLogic];

    /// OS thread name.
    #[must_use]
    pub fn thread_name(self) -> &'static str {
        match self {
            Self::Producer => "tsn-producer",
            Self::Consumer => "tsn-consumer",
            Self::UserLogic => "tsn-userlogic",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer => write!(f, "producer"),
            Self::Consumer => write!(f, "consumer"),
            Self::UserLogic => write!(f, "user_logic"),
        }
    }
}

/// Producer/transmitter payload.
pub struct ProducerRole {
    counters: BankReader,
    publisher: Box<dyn Publisher>,
    period_ns: u64,
    phase: f64,
    transmit_offset_ns: u64,
    txtime_enabled: bool,
}

impl ProducerRole {
    /// Create the producer payload.
    #[must_use]
    pub fn new(
        counters: BankReader,
        publisher: Box<dyn Publisher>,
        period_ns: u64,
        phase: f64,
        transmit_offset_ns: u64,
        txtime_enabled: bool,
    ) -> Self {
        Self {
            counters,
            publisher,
            period_ns,
            phase,
            transmit_offset_ns,
            txtime_enabled,
        }
    }

    /// Launch time for a frame prepared at `deadline`.
    #[must_use]
    pub fn transmission_time(&self, tick: &Tick) -> u64 {
        transmission_time_ns(
            tick.deadline,
            self.period_ns,
            self.phase,
            self.transmit_offset_ns,
        )
    }

    /// Send the current producer counters.
    #[inline]
    pub fn fire(&mut self, tick: Tick) {
        let snapshot = self.counters.snapshot();
        let txtime = self.txtime_enabled.then(|| self.transmission_time(&tick));
        self.publisher.transmit(&snapshot, txtime);
    }
}

/// Consumer/receiver payload.
pub struct ConsumerRole {
    subscriber: Box<dyn Subscriber>,
    counters: BankWriter,
    received: u64,
}

impl ConsumerRole {
    /// Create the consumer payload; it becomes the only writer of `counters`.
    #[must_use]
    pub fn new(subscriber: Box<dyn Subscriber>, counters: BankWriter) -> Self {
        Self {
            subscriber,
            counters,
            received: 0,
        }
    }

    /// Frames received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Poll the transport once.
    #[inline]
    pub fn fire(&mut self, _tick: Tick) {
        if self.subscriber.receive_if_available(&mut self.counters) {
            self.received += 1;
        }
    }
}

/// Measurement records written by the user logic role.
#[derive(Debug)]
pub struct MeasurementLogs {
    /// Producer-side `(counter, modification time)` pairs.
    pub publisher: MeasurementRecord,
    /// Consumer-side `(counter, receive time)` pairs.
    pub subscriber: MeasurementRecord,
}

/// User logic payload.
pub struct UserLogicRole {
    producer: BankWriter,
    consumer: BankReader,
    clock: Arc<dyn Clock>,
    logs: Option<MeasurementLogs>,
}

impl UserLogicRole {
    /// Create the payload and seed the producer bank: the primary counter
    /// starts at 0 and every repeated counter at `repeated_initial`.
    #[must_use]
    pub fn new(
        mut producer: BankWriter,
        consumer: BankReader,
        repeated_initial: u64,
        clock: Arc<dyn Clock>,
        logs: Option<MeasurementLogs>,
    ) -> Self {
        producer.set(0, 0);
        for idx in 1..producer.len() {
            producer.set(idx, repeated_initial);
        }
        Self {
            producer,
            consumer,
            clock,
            logs,
        }
    }

    /// Increment every producer counter and record measurements.
    #[inline]
    pub fn fire(&mut self, _tick: Tick) {
        self.producer.increment_all();
        let modified_at = self.clock.now();

        if let Some(logs) = self.logs.as_mut() {
            let received_at = self.clock.now();
            logs.publisher.append(self.producer.get(0), modified_at);

            let consumed = self.consumer.primary();
            if consumed > 0 {
                logs.subscriber.append(consumed, received_at);
            }
        }
    }

    /// Hand back the measurement records once the loop has exited.
    #[must_use]
    pub fn into_logs(self) -> Option<MeasurementLogs> {
        self.logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use tsn_common::counters::{counter_bank, CounterSnapshot};
    use tsn_common::state::RunFlag;
    use tsn_common::time::Deadline;
    use tsn_transport::{GroupId, LoopbackTransport, Transport};

    fn tick(deadline: Deadline) -> Tick {
        Tick {
            cycle: 0,
            deadline,
            now: deadline,
        }
    }

    #[test]
    fn test_role_names() {
        assert_eq!(Role::UserLogic.to_string(), "user_logic");
        assert_eq!(Role::Consumer.thread_name(), "tsn-consumer");
    }

    #[test]
    fn test_user_logic_seeds_and_increments() {
        let (writer, reader) = counter_bank("producer", 3);
        let (_, consumer) = counter_bank("consumer", 3);
        let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::default());
        let mut role = UserLogicRole::new(writer, consumer, 10, clock, None);

        assert_eq!(reader.snapshot().as_slice(), &[0, 10, 10]);
        for _ in 0..5 {
            role.fire(tick(Deadline::default()));
        }
        assert_eq!(reader.snapshot().as_slice(), &[5, 15, 15]);
    }

    #[test]
    fn test_user_logic_skips_consumer_until_nonzero() {
        let flag = RunFlag::new();
        let (writer, _) = counter_bank("producer", 1);
        let (mut consumer_writer, consumer) = counter_bank("consumer", 1);
        let clock = Arc::new(SimulatedClock::at_secs(20));
        let logs = MeasurementLogs {
            publisher: MeasurementRecord::new("publisher", 10, flag.clone()),
            subscriber: MeasurementRecord::new("subscriber", 10, flag),
        };
        let mut role = UserLogicRole::new(writer, consumer, 10, clock.clone(), Some(logs));

        role.fire(tick(Deadline::default()));
        consumer_writer.set(0, 1);
        clock.advance(1_000);
        role.fire(tick(Deadline::default()));

        let logs = role.into_logs().unwrap();
        assert_eq!(logs.publisher.len(), 2);
        assert_eq!(logs.publisher.samples()[1].value, 2);
        assert_eq!(logs.publisher.samples()[1].timestamp, Deadline::new(20, 1_000));
        assert_eq!(logs.subscriber.len(), 1);
        assert_eq!(logs.subscriber.samples()[0].value, 1);
    }

    #[test]
    fn test_producer_transmits_with_launch_time() {
        let mut transport = LoopbackTransport::new();
        let probe = transport.probe();
        let publisher = transport.register_writer_group(GroupId(101)).unwrap();
        let mut sub = transport.register_reader_group(GroupId(100)).unwrap();

        let (mut writer, reader) = counter_bank("producer", 3);
        writer.store_snapshot(&CounterSnapshot::from_slice(&[7, 17, 17]));
        let mut role = ProducerRole::new(reader, publisher, 250_000, 0.6, 125_000, true);

        let wake = Deadline::new(1_000, 400_000);
        role.fire(tick(wake));
        assert_eq!(probe.last_txtime_ns(), Some(wake.as_nanos() + 100_000 + 125_000));

        let (mut sink, got) = counter_bank("consumer", 3);
        assert!(sub.receive_if_available(&mut sink));
        assert_eq!(got.snapshot().as_slice(), &[7, 17, 17]);
    }

    #[test]
    fn test_producer_without_txtime() {
        let mut transport = LoopbackTransport::new();
        let probe = transport.probe();
        let publisher = transport.register_writer_group(GroupId(101)).unwrap();
        let (_, reader) = counter_bank("producer", 1);
        let mut role = ProducerRole::new(reader, publisher, 250_000, 0.6, 125_000, false);

        role.fire(tick(Deadline::new(5, 0)));
        assert_eq!(probe.stats().frames_sent, 1);
        assert_eq!(probe.last_txtime_ns(), None);
    }

    #[test]
    fn test_consumer_counts_frames() {
        let mut transport = LoopbackTransport::new();
        let mut publisher = transport.register_writer_group(GroupId(101)).unwrap();
        let subscriber = transport.register_reader_group(GroupId(100)).unwrap();
        let (writer, reader) = counter_bank("consumer", 3);
        let mut role = ConsumerRole::new(subscriber, writer);

        role.fire(tick(Deadline::default()));
        publisher.transmit(&CounterSnapshot::from_slice(&[3, 13, 13]), None);
        role.fire(tick(Deadline::default()));
        role.fire(tick(Deadline::default()));

        assert_eq!(role.received(), 1);
        assert_eq!(reader.primary(), 3);
    }
}
