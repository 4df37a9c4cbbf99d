//! Termination triggers.

use std::fmt;
use std::process::ExitStatus;

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::error::{Result, SupervisorError};

/// Why the supervisor left its steady state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Hangup,
    /// A supervised service exited on its own.
    ServiceExited {
        service: String,
        status: Option<ExitStatus>,
    },
}

impl ShutdownReason {
    /// Process exit code for this reason. Signals are a normal stop.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::ServiceExited { .. } => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt"),
            ShutdownReason::Terminate => write!(f, "terminate signal"),
            ShutdownReason::Hangup => write!(f, "hangup"),
            ShutdownReason::ServiceExited { service, status: Some(status) } => {
                write!(f, "{} exited ({})", service, status)
            }
            ShutdownReason::ServiceExited { service, status: None } => {
                write!(f, "{} exited", service)
            }
        }
    }
}

/// SIGINT, SIGTERM and SIGHUP listeners.
///
/// Install before spawning anything: once registered, these signals no
/// longer kill the supervisor outright, so cleanup always gets to run.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl ShutdownSignals {
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?,
            terminate: signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?,
            hangup: signal(SignalKind::hangup()).map_err(SupervisorError::Signal)?,
        })
    }

    /// Resolve on the first trigger received.
    pub async fn recv(&mut self) -> ShutdownReason {
        let reason = tokio::select! {
            _ = self.interrupt.recv() => ShutdownReason::Interrupt,
            _ = self.terminate.recv() => ShutdownReason::Terminate,
            _ = self.hangup.recv() => ShutdownReason::Hangup,
        };
        log::info!("[Supervisor] Received {}, shutting down", reason);
        reason
    }
}
