//! Transport plane abstractions for the cyclic executive.
//!
//! This crate provides:
//! - [`Transport`] trait for registering writer and reader groups
//! - [`Publisher`] / [`Subscriber`] handles moved into the producer and
//!   consumer role threads
//! - [`loopback`] module with an in-process wire that feeds published frames
//!   back to the subscriber
//! - [`NullTransport`] which sends nowhere and never receives
//!
//! The publish/subscribe stack itself (message encoding, Ethernet framing,
//! launch-time queues) sits behind these traits.

pub mod loopback;

pub use loopback::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use tsn_common::counters::{BankWriter, CounterSnapshot};
use tsn_common::error::{RtError, RtResult};

/// Writer or reader group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u16);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {}", self.0)
    }
}

/// Sending half, owned by the producer thread.
///
/// Called once per producer cycle. Implementations must not block and have
/// no error path: a frame that cannot be sent is dropped.
pub trait Publisher: Send {
    /// Send one cycle's counters.
    ///
    /// `transmission_time_ns` is the absolute launch time on the executive
    /// clock, or `None` when launch-time scheduling is disabled.
    fn transmit(&mut self, snapshot: &CounterSnapshot, transmission_time_ns: Option<u64>);
}

/// Receiving half, owned by the consumer thread.
pub trait Subscriber: Send {
    /// Copy a newly arrived frame into `sink`, if there is one.
    ///
    /// Never blocks. Returns `true` when `sink` was updated.
    fn receive_if_available(&mut self, sink: &mut BankWriter) -> bool;
}

/// Group registration, used once at startup and once at shutdown.
pub trait Transport {
    /// Register a writer group and return its publisher.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::Transport`] if the group cannot be created.
    fn register_writer_group(&mut self, id: GroupId) -> RtResult<Box<dyn Publisher>>;

    /// Register a reader group and return its subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::Transport`] if the group cannot be created.
    fn register_reader_group(&mut self, id: GroupId) -> RtResult<Box<dyn Subscriber>>;

    /// Remove a previously registered group.
    ///
    /// # Errors
    ///
    /// Returns [`RtError::Transport`] if the group is unknown.
    fn unregister(&mut self, id: GroupId) -> RtResult<()>;
}

/// Bookkeeping shared by the transports in this crate.
#[derive(Debug, Default)]
struct GroupRegistry {
    groups: Vec<GroupId>,
}

impl GroupRegistry {
    fn add(&mut self, id: GroupId) -> RtResult<()> {
        if self.groups.contains(&id) {
            return Err(RtError::Transport(format!("{id} already registered")));
        }
        debug!(%id, "Group registered");
        self.groups.push(id);
        Ok(())
    }

    fn remove(&mut self, id: GroupId) -> RtResult<()> {
        let pos = self
            .groups
            .iter()
            .position(|g| *g == id)
            .ok_or_else(|| RtError::Transport(format!("{id} is not registered")))?;
        self.groups.swap_remove(pos);
        debug!(%id, "Group unregistered");
        Ok(())
    }

    fn contains(&self, id: GroupId) -> bool {
        self.groups.contains(&id)
    }
}

/// Transport that discards every frame and never receives.
#[derive(Debug, Default)]
pub struct NullTransport {
    registry: GroupRegistry,
}

impl NullTransport {
    /// Create a transport with no groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is currently registered.
    #[must_use]
    pub fn is_registered(&self, id: GroupId) -> bool {
        self.registry.contains(id)
    }
}

struct NullPublisher;

impl Publisher for NullPublisher {
    fn transmit(&mut self, _snapshot: &CounterSnapshot, _transmission_time_ns: Option<u64>) {}
}

struct NullSubscriber;

impl Subscriber for NullSubscriber {
    fn receive_if_available(&mut self, _sink: &mut BankWriter) -> bool {
        false
    }
}

impl Transport for NullTransport {
    fn register_writer_group(&mut self, id: GroupId) -> RtResult<Box<dyn Publisher>> {
        self.registry.add(id)?;
        Ok(Box::new(NullPublisher))
    }

    fn register_reader_group(&mut self, id: GroupId) -> RtResult<Box<dyn Subscriber>> {
        self.registry.add(id)?;
        Ok(Box::new(NullSubscriber))
    }

    fn unregister(&mut self, id: GroupId) -> RtResult<()> {
        self.registry.remove(id)
    }
}
