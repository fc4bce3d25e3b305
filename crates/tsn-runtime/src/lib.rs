#![doc = "Real-time cyclic executive: clocks, periodic task runner, role threads, and measurement records."]

pub mod clock;
pub mod lifecycle;
pub mod measurement;
pub mod realtime;
pub mod roles;
pub mod task;

pub use clock::*;
pub use lifecycle::*;
pub use measurement::*;
pub use realtime::*;
pub use roles::*;
pub use task::*;
