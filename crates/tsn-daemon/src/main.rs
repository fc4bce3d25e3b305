//! tsn-cyclic daemon entry point.
//!
//! Runs the producer, consumer, and user logic roles on their pinned
//! real-time threads until SIGINT/SIGTERM, a full measurement record, or the
//! optional cycle limit stops them. Measurement records are written as CSV
//! once every role has been joined.

mod signals;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tsn_common::config::{ExecutiveConfig, MIN_CYCLE_TIME_MS};
use tsn_common::state::RunFlag;
use tsn_runtime::clock::SystemClock;
use tsn_runtime::lifecycle::{CyclicExecutive, ExecutiveReport};
use tsn_runtime::roles::MeasurementLogs;
use tsn_transport::LoopbackTransport;

use crate::signals::SignalForwarder;

/// How often the main thread checks whether the roles have stopped.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// tsn-cyclic command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "tsn-cyclic",
    about = "Real-time cyclic pub/sub executive for TSN counter exchange",
    version,
    long_about = None
)]
struct Args {
    /// Network interface for the publisher and subscriber (required).
    #[arg(long, short = 'i', value_name = "IFACE")]
    interface: Option<String>,

    /// Cycle time in milliseconds (minimum 0.125).
    #[arg(long, value_name = "MS")]
    cycle_time_ms: Option<f64>,

    /// SO_PRIORITY of the publisher socket.
    #[arg(long)]
    socket_priority: Option<i32>,

    /// Real-time priority of the producer thread.
    #[arg(long)]
    pub_priority: Option<u8>,

    /// Real-time priority of the consumer thread.
    #[arg(long)]
    sub_priority: Option<u8>,

    /// Real-time priority of the user logic thread.
    #[arg(long)]
    user_app_priority: Option<u8>,

    /// CPU core of the producer thread.
    #[arg(long)]
    pub_core: Option<usize>,

    /// CPU core of the consumer thread.
    #[arg(long)]
    sub_core: Option<usize>,

    /// CPU core of the user logic thread.
    #[arg(long)]
    user_app_core: Option<usize>,

    /// Publisher destination URL, e.g. `opc.eth://01-00-5E-7F-00-01:8.3`.
    #[arg(long, value_name = "URL")]
    pub_mac_address: Option<String>,

    /// Subscriber source URL, e.g. `opc.eth://01-00-5E-00-00-01:8.3`.
    #[arg(long, value_name = "URL")]
    sub_mac_address: Option<String>,

    /// Launch offset after the cycle boundary, in microseconds.
    #[arg(long, value_name = "US")]
    qbv_offset: Option<u64>,

    /// Do not attach a launch time to published frames.
    #[arg(long)]
    disable_so_txtime: bool,

    /// Record counters and write publisher/subscriber CSV files at shutdown.
    #[arg(long)]
    enable_csv_log: bool,

    /// Warm-up delay before the first cycle (e.g. "5s", "500ms").
    #[arg(long, value_parser = humantime::parse_duration)]
    start_delay: Option<Duration>,

    /// Stop each role after this many cycles (0 = run until signalled).
    #[arg(long, default_value = "0")]
    max_cycles: u64,

    /// Skip priority, affinity, and memory locking (unprivileged test runs).
    #[arg(long)]
    no_realtime: bool,

    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line values take precedence over the configuration file.
    fn apply(&self, config: &mut ExecutiveConfig) {
        if let Some(interface) = &self.interface {
            config.network.interface = Some(interface.clone());
        }
        if let Some(ms) = self.cycle_time_ms {
            config.cycle_time_ms = ms;
        }
        if let Some(p) = self.socket_priority {
            config.network.socket_priority = p;
        }
        if let Some(p) = self.pub_priority {
            config.producer.priority = p;
        }
        if let Some(p) = self.sub_priority {
            config.consumer.priority = p;
        }
        if let Some(p) = self.user_app_priority {
            config.user_logic.priority = p;
        }
        if let Some(c) = self.pub_core {
            config.producer.core = c;
        }
        if let Some(c) = self.sub_core {
            config.consumer.core = c;
        }
        if let Some(c) = self.user_app_core {
            config.user_logic.core = c;
        }
        if let Some(url) = &self.pub_mac_address {
            config.network.publisher_url = url.clone();
        }
        if let Some(url) = &self.sub_mac_address {
            config.network.subscriber_url = url.clone();
        }
        if let Some(us) = self.qbv_offset {
            config.transmit_offset_us = us;
        }
        if self.disable_so_txtime {
            config.network.txtime_enabled = false;
        }
        if self.enable_csv_log {
            config.measurement.enabled = true;
        }
        if let Some(delay) = self.start_delay {
            config.start_delay = delay;
        }
        if self.no_realtime {
            config.realtime.enabled = false;
        }
    }

    fn cycle_limit(&self) -> Option<u64> {
        (self.max_cycles > 0).then_some(self.max_cycles)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tsn-cyclic");

    let mut config = load_config(&args)?;
    args.apply(&mut config);
    check_startup_config(&config)?;

    info!(
        interface = config.network.interface.as_deref().unwrap_or_default(),
        cycle_time_ms = config.cycle_time_ms,
        publisher = %config.network.publisher_url,
        subscriber = %config.network.subscriber_url,
        publisher_id = config.network.publisher_id,
        socket_priority = config.network.socket_priority,
        txtime = config.network.txtime_enabled,
        csv_log = config.measurement.enabled,
        "Configuration loaded"
    );

    run_daemon(&config, args.cycle_limit()).inspect_err(|e| {
        error!("tsn-cyclic failed: {e:#}");
    })
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "tsn_daemon={level},tsn_runtime={level},tsn_transport={level},tsn_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `TSN_CONFIG_PATH` environment variable
/// 3. `/etc/tsn-cyclic/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<ExecutiveConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return ExecutiveConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("TSN_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from TSN_CONFIG_PATH");
            return ExecutiveConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from TSN_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "TSN_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for candidate in ["/etc/tsn-cyclic/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(candidate);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return ExecutiveConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(ExecutiveConfig::default())
}

/// Reject configurations that must never reach thread creation.
fn check_startup_config(config: &ExecutiveConfig) -> Result<()> {
    if config.network.interface.as_deref().map_or(true, str::is_empty) {
        bail!("Missing network interface: pass --interface <IFACE> or set [network] interface");
    }
    if config.cycle_time_ms < MIN_CYCLE_TIME_MS {
        bail!(
            "Cycle time {} ms is below the minimum of {MIN_CYCLE_TIME_MS} ms",
            config.cycle_time_ms
        );
    }
    config.validate().context("Invalid configuration")?;
    Ok(())
}

/// Launch the executive, wait for it to stop, and export the results.
fn run_daemon(config: &ExecutiveConfig, cycle_limit: Option<u64>) -> Result<()> {
    let run_flag = RunFlag::new();
    let signals =
        SignalForwarder::install(run_flag.clone()).context("Failed to set up signal handlers")?;

    let executive = CyclicExecutive::new(config.clone())
        .cycle_limit(cycle_limit)
        .run_flag(run_flag);

    let transport = LoopbackTransport::new();
    let wire = transport.probe();
    let clock = Arc::new(SystemClock::new(config.clock));

    let running = executive
        .launch(transport, clock)
        .context("Failed to start cyclic executive")?;

    running.wait(WAIT_POLL);
    if let Some(signal) = signals.received() {
        info!(%signal, "Stopping on signal");
    } else if signals.shutdown_requested() {
        info!("Stop requested by the executive");
    } else {
        info!("All roles reached the cycle limit");
    }

    let report = running.shutdown();
    log_report(&report);
    info!(wire = ?wire.stats(), "Transport statistics");

    if let Some(logs) = &report.logs {
        save_measurements(logs, config);
    }

    info!("Daemon shutdown complete");
    Ok(())
}

fn log_report(report: &ExecutiveReport) {
    for (role, task) in &report.tasks {
        info!(
            %role,
            cycles = task.cycles,
            jitter_ns = task.wakeup.jitter_ns().unwrap_or(0),
            missed = task.wakeup.missed_count,
            "Role finished"
        );
        if let Ok(json) = serde_json::to_string(task) {
            debug!(%role, report = %json, "Role report");
        }
    }
    info!(
        producer = ?report.producer_final,
        consumer = ?report.consumer_final,
        "Final counters"
    );
}

/// Write both records; a failed write is logged and skipped.
fn save_measurements(logs: &MeasurementLogs, config: &ExecutiveConfig) {
    let outputs = [
        (&logs.publisher, &config.measurement.publisher_file),
        (&logs.subscriber, &config.measurement.subscriber_file),
    ];
    for (record, path) in outputs {
        if let Err(e) = record.save(path) {
            warn!(label = record.label(), path = %path.display(), error = %e, "Failed to write CSV");
        }
    }
}
