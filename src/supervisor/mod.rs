//! Supervised scheduling of shelf scan cycles.
//!
//! - `policy`: tunables (`K`, `M`, backoff, restart budget)
//! - `state`: the health state machine and counters
//! - `cadence`: when the next cycle may start
//! - `runner`: the run loop thread
//! - `status`: what the control surface reads

pub mod cadence;
mod policy;
mod runner;
mod state;
mod status;

pub use policy::SupervisorPolicy;
pub use runner::{Control, Pipeline, Runner, DEFAULT_DETECTION_DEADLINE, DEFAULT_JPEG_QUALITY};
pub use state::{CycleCounters, ServiceState, SupervisorState, Verdict};
pub use status::{StatusBoard, StatusSnapshot};
