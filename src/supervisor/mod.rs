//! Service Supervision
//!
//! Runs the coaching API server and its dashboard as child processes.
//! The supervisor module coordinates; config, process, health and signal
//! hold the pieces it is built from.

pub mod config;
pub mod health;
pub mod manager;
pub mod process;
pub mod signal;

pub use config::{Readiness, ServiceConfig, SupervisorConfig};
pub use manager::Supervisor;
pub use signal::{ShutdownReason, ShutdownSignals};
