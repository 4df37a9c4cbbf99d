use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Errors raised while loading settings or bringing services up.
///
/// Termination failures are not represented here: killing a process that is
/// already gone is not an error, and the kill helpers only log.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to read settings from {}: {source}", .path.display())]
    Settings {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings in {}: {source}", .path.display())]
    SettingsParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to spawn {service}: {source}")]
    Spawn {
        service: String,
        source: std::io::Error,
    },

    #[error("{service} exited before becoming ready ({status})")]
    ExitedEarly { service: String, status: ExitStatus },

    #[error("{service} did not become ready within {timeout:?}")]
    ReadinessTimeout { service: String, timeout: Duration },

    #[error("port {port} is already in use{}", describe_holder(.holder))]
    PortInUse { port: u16, holder: Option<String> },

    #[error("failed to install signal handler: {0}")]
    Signal(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn describe_holder(holder: &Option<String>) -> String {
    match holder {
        Some(h) => format!(" by {}", h),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use_names_holder() {
        let err = SupervisorError::PortInUse {
            port: 8000,
            holder: Some("python3 (PID: 4242)".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "port 8000 is already in use by python3 (PID: 4242)"
        );

        let err = SupervisorError::PortInUse { port: 8501, holder: None };
        assert_eq!(err.to_string(), "port 8501 is already in use");
    }

    #[test]
    fn readiness_timeout_message() {
        let err = SupervisorError::ReadinessTimeout {
            service: "backend".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "backend did not become ready within 30s");
    }
}
