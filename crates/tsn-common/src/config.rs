//! Configuration structures for the cyclic executive.
//!
//! Supports TOML deserialization with defaults matching the reference
//! 250 µs TSN deployment. Every value is fixed once the executive starts.

use crate::error::{RtError, RtResult};
use crate::counters::MAX_COUNTERS;
use crate::time::{cycle_period_ns, phase_offset_ns, NSEC_PER_USEC};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest accepted cycle time in milliseconds.
pub const MIN_CYCLE_TIME_MS: f64 = 0.125;

/// Default cycle time in milliseconds.
pub const DEFAULT_CYCLE_TIME_MS: f64 = 0.25;

/// Default launch offset after the cycle boundary, in microseconds.
pub const DEFAULT_TRANSMIT_OFFSET_US: u64 = 125;

/// Default capacity of each measurement record.
pub const DEFAULT_MEASUREMENT_CAPACITY: usize = 10_000_000;

/// Top-level executive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutiveConfig {
    /// Cycle period in fractional milliseconds.
    pub cycle_time_ms: f64,

    /// Warm-up delay before the first wake-up of every role.
    #[serde(with = "humantime_serde")]
    pub start_delay: Duration,

    /// Launch offset added after the next cycle boundary, in microseconds.
    pub transmit_offset_us: u64,

    /// Clock all deadlines are expressed on.
    pub clock: ClockSource,

    /// Number of repeated counters carried next to the primary counter.
    pub repeated_counters: usize,

    /// Initial value of the producer's repeated counters.
    pub repeated_initial: u64,

    /// Producer/transmitter role.
    #[serde(deserialize_with = "role_section::producer")]
    pub producer: RoleConfig,

    /// Consumer/receiver role.
    #[serde(deserialize_with = "role_section::consumer")]
    pub consumer: RoleConfig,

    /// User logic role.
    #[serde(deserialize_with = "role_section::user_logic")]
    pub user_logic: RoleConfig,

    /// Real-time process setup.
    pub realtime: RealtimeConfig,

    /// Network identifiers handed to the transport.
    pub network: NetworkConfig,

    /// Measurement logging.
    pub measurement: MeasurementConfig,
}

impl Default for ExecutiveConfig {
    fn default() -> Self {
        Self {
            cycle_time_ms: DEFAULT_CYCLE_TIME_MS,
            start_delay: Duration::from_secs(5),
            transmit_offset_us: DEFAULT_TRANSMIT_OFFSET_US,
            clock: ClockSource::Tai,
            repeated_counters: 2,
            repeated_initial: 10,
            producer: RoleConfig::producer(),
            consumer: RoleConfig::consumer(),
            user_logic: RoleConfig::user_logic(),
            realtime: RealtimeConfig::default(),
            network: NetworkConfig::default(),
            measurement: MeasurementConfig::default(),
        }
    }
}

/// Wake phase, priority, and core of one role thread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Fraction of the cycle at which the role wakes, in `[0, 1)`.
    pub wakeup_fraction: f64,
    /// SCHED_FIFO priority (1-99).
    pub priority: u8,
    /// CPU core the thread is pinned to.
    pub core: usize,
}

impl RoleConfig {
    /// Producer defaults: wake at 60% of the cycle, leaving 40% to prepare the frame.
    #[must_use]
    pub const fn producer() -> Self {
        Self {
            wakeup_fraction: 0.6,
            priority: 78,
            core: 2,
        }
    }

    /// Consumer defaults: wake at the cycle boundary.
    #[must_use]
    pub const fn consumer() -> Self {
        Self {
            wakeup_fraction: 0.0,
            priority: 81,
            core: 2,
        }
    }

    /// User logic defaults: wake at 30% of the cycle.
    #[must_use]
    pub const fn user_logic() -> Self {
        Self {
            wakeup_fraction: 0.3,
            priority: 75,
            core: 3,
        }
    }
}

/// Clock the executive reads and sleeps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// CLOCK_TAI, shared with the NIC's hardware launch time.
    #[default]
    Tai,
    /// CLOCK_MONOTONIC.
    Monotonic,
    /// CLOCK_REALTIME.
    Realtime,
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Apply priority and affinity to role threads (requires privileges).
    pub enabled: bool,

    /// Scheduler policy for role threads.
    pub policy: SchedPolicy,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,

    /// Pre-fault stack size in bytes.
    pub prefault_stack_size: usize,

    /// Check RLIMIT_RTPRIO / RLIMIT_MEMLOCK up front and refuse to start if they
    /// cannot be satisfied.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: SchedPolicy::Fifo,
            lock_memory: true,
            prefault_stack_size: 8 * 1024 * 1024, // 8 MiB
            fail_fast: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
}

/// Network identifiers. Opaque to the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network interface name (e.g. "enp3s0").
    /// Must be explicitly configured - no default to avoid using the wrong interface.
    pub interface: Option<String>,

    /// Publisher destination, `opc.eth://<mac>:<vlan>.<pcp>`.
    pub publisher_url: String,

    /// Subscriber source, `opc.eth://<mac>:<vlan>.<pcp>`.
    pub subscriber_url: String,

    /// SO_PRIORITY for the publisher socket. Passed through to a socket-backed
    /// transport; the loopback wire has no socket.
    pub socket_priority: i32,

    /// Hand the computed launch time to the transport with every frame.
    pub txtime_enabled: bool,

    /// Publisher identifier carried in frame headers by a real transport.
    pub publisher_id: u16,

    /// Writer group identifier.
    pub writer_group_id: u16,

    /// Reader group identifier.
    pub reader_group_id: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: None,
            publisher_url: String::from("opc.eth://01-00-5E-7F-00-01:8.3"),
            subscriber_url: String::from("opc.eth://01-00-5E-00-00-01:8.3"),
            socket_priority: 3,
            txtime_enabled: true,
            publisher_id: 2234,
            writer_group_id: 101,
            reader_group_id: 100,
        }
    }
}

/// Measurement logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Record `(counter, timestamp)` pairs and write them as CSV at shutdown.
    pub enabled: bool,

    /// Maximum records per side; reaching it stops the executive.
    pub capacity: usize,

    /// Output file for producer-side records.
    pub publisher_file: PathBuf,

    /// Output file for consumer-side records.
    pub subscriber_file: PathBuf,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: DEFAULT_MEASUREMENT_CAPACITY,
            publisher_file: PathBuf::from("publisher_T1.csv"),
            subscriber_file: PathBuf::from("subscriber_T8.csv"),
        }
    }
}

impl ExecutiveConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Cycle period in nanoseconds.
    #[must_use]
    pub fn period_ns(&self) -> u64 {
        cycle_period_ns(self.cycle_time_ms)
    }

    /// Launch offset in nanoseconds.
    #[must_use]
    pub fn transmit_offset_ns(&self) -> u64 {
        self.transmit_offset_us * NSEC_PER_USEC
    }

    /// Total counter cells per side (primary plus repeated).
    #[must_use]
    pub fn counter_count(&self) -> usize {
        1 + self.repeated_counters
    }

    /// Check the configuration before any thread is created.
    ///
    /// Wake phases are checked individually only; their relative order is an
    /// operator contract (see [`ExecutiveConfig::phase_order_is_consistent`]).
    ///
    /// # Errors
    ///
    /// Returns an error for a cycle below [`MIN_CYCLE_TIME_MS`], a wake fraction
    /// outside `[0, 1)`, a priority outside 1-99, or more counters than a
    /// snapshot can hold.
    pub fn validate(&self) -> RtResult<()> {
        if !self.cycle_time_ms.is_finite() || self.cycle_time_ms < MIN_CYCLE_TIME_MS {
            return Err(RtError::InvalidCycleTime {
                cycle_time_ms: self.cycle_time_ms,
                minimum_ms: MIN_CYCLE_TIME_MS,
            });
        }

        for (name, role) in self.roles() {
            if !(0.0..1.0).contains(&role.wakeup_fraction) {
                return Err(RtError::InvalidPhase {
                    role: name.to_string(),
                    fraction: role.wakeup_fraction,
                });
            }
            if !(1..=99).contains(&role.priority) {
                return Err(RtError::Config(format!(
                    "{name} priority {} outside 1-99",
                    role.priority
                )));
            }
        }

        if self.counter_count() > MAX_COUNTERS {
            return Err(RtError::Config(format!(
                "{} repeated counters requested, at most {} supported",
                self.repeated_counters,
                MAX_COUNTERS - 1
            )));
        }

        if self.measurement.enabled && self.measurement.capacity == 0 {
            return Err(RtError::Config(
                "measurement capacity must be non-zero when logging is enabled".into(),
            ));
        }

        Ok(())
    }

    /// Whether user logic is scheduled to update the producer counters
    /// before the producer reads them in the same cycle.
    #[must_use]
    pub fn phase_order_is_consistent(&self) -> bool {
        let period = self.period_ns();
        phase_offset_ns(period, self.user_logic.wakeup_fraction)
            < phase_offset_ns(period, self.producer.wakeup_fraction)
    }

    fn roles(&self) -> [(&'static str, &RoleConfig); 3] {
        [
            ("producer", &self.producer),
            ("consumer", &self.consumer),
            ("user_logic", &self.user_logic),
        ]
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Role sections merge over the role's own defaults, so a section may set
/// any subset of `wakeup_fraction`, `priority`, and `core`.
mod role_section {
    use super::RoleConfig;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct PartialRole {
        wakeup_fraction: Option<f64>,
        priority: Option<u8>,
        core: Option<usize>,
    }

    impl PartialRole {
        fn over(self, defaults: RoleConfig) -> RoleConfig {
            RoleConfig {
                wakeup_fraction: self.wakeup_fraction.unwrap_or(defaults.wakeup_fraction),
                priority: self.priority.unwrap_or(defaults.priority),
                core: self.core.unwrap_or(defaults.core),
            }
        }
    }

    pub fn producer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RoleConfig, D::Error> {
        Ok(PartialRole::deserialize(deserializer)?.over(RoleConfig::producer()))
    }

    pub fn consumer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RoleConfig, D::Error> {
        Ok(PartialRole::deserialize(deserializer)?.over(RoleConfig::consumer()))
    }

    pub fn user_logic<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RoleConfig, D::Error> {
        Ok(PartialRole::deserialize(deserializer)?.over(RoleConfig::user_logic()))
    }
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExecutiveConfig::default();
        assert_eq!(config.period_ns(), 250_000);
        assert_eq!(config.transmit_offset_ns(), 125_000);
        assert_eq!(config.start_delay, Duration::from_secs(5));
        assert_eq!(config.producer.priority, 78);
        assert_eq!(config.consumer.priority, 81);
        assert_eq!(config.user_logic.core, 3);
        assert_eq!(config.counter_count(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_cycle_below_minimum() {
        let config = ExecutiveConfig {
            cycle_time_ms: 0.1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RtError::InvalidCycleTime { .. })
        ));
    }

    #[test]
    fn test_accepts_minimum_cycle() {
        let config = ExecutiveConfig {
            cycle_time_ms: MIN_CYCLE_TIME_MS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_nan_cycle() {
        let config = ExecutiveConfig {
            cycle_time_ms: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_fraction_of_one() {
        let mut config = ExecutiveConfig::default();
        config.consumer.wakeup_fraction = 1.0;
        assert_eq!(
            config.validate(),
            Err(RtError::InvalidPhase {
                role: "consumer".into(),
                fraction: 1.0
            })
        );
    }

    #[test]
    fn test_rejects_zero_priority() {
        let mut config = ExecutiveConfig::default();
        config.user_logic.priority = 0;
        assert!(matches!(config.validate(), Err(RtError::Config(_))));
    }

    #[test]
    fn test_rejects_too_many_counters() {
        let config = ExecutiveConfig {
            repeated_counters: MAX_COUNTERS,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_phase_order() {
        let mut config = ExecutiveConfig::default();
        assert!(config.phase_order_is_consistent());

        config.user_logic.wakeup_fraction = 0.7;
        assert!(!config.phase_order_is_consistent());
        // Misordered phases are still a valid configuration.
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            cycle_time_ms = 1.0
            start_delay = "2s"
            clock = "monotonic"

            [producer]
            wakeup_fraction = 0.5
            priority = 90
            core = 1

            [network]
            interface = "enp3s0"

            [measurement]
            enabled = true
            capacity = 1000
        "#;

        let config = ExecutiveConfig::from_toml(toml).unwrap();
        assert_eq!(config.period_ns(), 1_000_000);
        assert_eq!(config.start_delay, Duration::from_secs(2));
        assert_eq!(config.clock, ClockSource::Monotonic);
        assert_eq!(config.producer.core, 1);
        assert_eq!(config.consumer, RoleConfig::consumer());
        assert_eq!(config.network.interface.as_deref(), Some("enp3s0"));
        assert!(config.measurement.enabled);
        assert_eq!(config.measurement.capacity, 1000);
    }

    #[test]
    fn test_partial_role_section_keeps_role_defaults() {
        let toml = r#"
            [producer]
            priority = 90

            [user_logic]
            core = 1
            wakeup_fraction = 0.25
        "#;

        let config = ExecutiveConfig::from_toml(toml).unwrap();
        assert_eq!(config.producer.priority, 90);
        assert_eq!(config.producer.wakeup_fraction, 0.6);
        assert_eq!(config.producer.core, 2);
        assert_eq!(config.user_logic.core, 1);
        assert_eq!(config.user_logic.wakeup_fraction, 0.25);
        assert_eq!(config.user_logic.priority, 75);
        assert_eq!(config.consumer, RoleConfig::consumer());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_role_key_rejected() {
        let toml = r#"
            [consumer]
            priorty = 80
        "#;
        assert!(ExecutiveConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_shipped_default_file_matches_defaults() {
        let config =
            ExecutiveConfig::from_toml(include_str!("../../../config/default.toml")).unwrap();
        let defaults = ExecutiveConfig::default();
        assert_eq!(config.period_ns(), defaults.period_ns());
        assert_eq!(config.producer, defaults.producer);
        assert_eq!(config.consumer, defaults.consumer);
        assert_eq!(config.user_logic, defaults.user_logic);
        assert_eq!(config.network.writer_group_id, 101);
        assert!(config.network.interface.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_clock_source_names() {
        let tai: ClockSource = serde_json::from_str("\"tai\"").unwrap();
        assert_eq!(tai, ClockSource::Tai);
        let rt: ClockSource = serde_json::from_str("\"realtime\"").unwrap();
        assert_eq!(rt, ClockSource::Realtime);
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = ExecutiveConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = ExecutiveConfig::from_toml(&toml).unwrap();
        assert_eq!(config.period_ns(), parsed.period_ns());
        assert_eq!(config.start_delay, parsed.start_delay);
        assert_eq!(config.producer, parsed.producer);
    }
}
