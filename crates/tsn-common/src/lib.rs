#![doc = "Common types shared across the tsn-cyclic workspace."]

pub mod config;
pub mod counters;
pub mod error;
pub mod metrics;
pub mod state;
pub mod time;

pub use config::*;
pub use counters::*;
pub use error::*;
pub use metrics::*;
pub use state::*;
pub use time::*;
