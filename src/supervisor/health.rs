//! Service Health Management
//!
//! Readiness probes, port checks and port-holder lookup.

use std::net::TcpListener;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::Command;

use super::config::{Readiness, ServiceConfig};
use super::process::{parse_pids, ManagedService};
use crate::error::{Result, SupervisorError};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Check if port is free
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Process currently listening on `port`, as "name (PID: n)".
pub async fn find_port_holder(port: u16) -> Option<String> {
    let output = Command::new("lsof")
        .args(["-ti", &format!(":{}", port)])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    let pid = *parse_pids(&String::from_utf8_lossy(&output.stdout)).first()?;

    let name = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    Some(format!("{} (PID: {})", name, pid))
}

/// Wait until nothing is bound to `port`.
///
/// Killed processes can take a moment to release their sockets after a sweep.
pub async fn wait_for_port_free(port: u16, timeout: Duration) -> Result<()> {
    let start = Instant::now();

    loop {
        if is_port_free(port) {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            let holder = find_port_holder(port).await;
            log::error!(
                "[Supervisor] Port {} still in use{}",
                port,
                holder.as_deref().map(|h| format!(" by {}", h)).unwrap_or_default()
            );
            return Err(SupervisorError::PortInUse { port, holder });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// A single readiness check against one service.
#[derive(Debug, Clone)]
pub struct Probe {
    readiness: Readiness,
    host: String,
    port: u16,
    client: reqwest::Client,
}

impl Probe {
    pub fn for_service(service: &ServiceConfig) -> Self {
        // Builder only fails if the TLS backend cannot initialise
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            readiness: service.readiness.clone(),
            host: service.probe_host().to_string(),
            port: service.port,
            client,
        }
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// URL probed in HTTP mode.
    pub fn url(&self) -> Option<String> {
        match &self.readiness {
            Readiness::Http { path } => {
                let path = if path.starts_with('/') { path.clone() } else { format!("/{}", path) };
                Some(format!("http://{}{}", self.authority(), path))
            }
            _ => None,
        }
    }

    /// Run the probe once. Delay mode always passes.
    pub async fn check(&self) -> bool {
        match &self.readiness {
            Readiness::Http { .. } => {
                let Some(url) = self.url() else {
                    return false;
                };
                match self.client.get(&url).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(_) => false,
                }
            }
            Readiness::Tcp => {
                matches!(
                    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(self.authority())).await,
                    Ok(Ok(_))
                )
            }
            Readiness::Delay { .. } => true,
        }
    }
}

/// Block until `service` passes `probe`.
///
/// Fails with `ExitedEarly` as soon as the child dies, and with
/// `ReadinessTimeout` once `timeout` elapses.
pub async fn wait_for_ready(
    service: &mut ManagedService,
    probe: &Probe,
    timeout: Duration,
) -> Result<()> {
    if let Readiness::Delay { millis } = probe.readiness() {
        tokio::time::sleep(Duration::from_millis(*millis)).await;
        return match service.try_exit_status() {
            Some(status) => Err(SupervisorError::ExitedEarly {
                service: service.name().to_string(),
                status,
            }),
            None => Ok(()),
        };
    }

    let start = Instant::now();

    loop {
        if let Some(status) = service.try_exit_status() {
            return Err(SupervisorError::ExitedEarly {
                service: service.name().to_string(),
                status,
            });
        }

        if probe.check().await {
            log::info!("[{}] Ready after {:?}", service.name(), start.elapsed());
            return Ok(());
        }

        if start.elapsed() >= timeout {
            return Err(SupervisorError::ReadinessTimeout {
                service: service.name().to_string(),
                timeout,
            });
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::supervisor::process::spawn_service;

    fn service_on(port: u16, readiness: Readiness) -> ServiceConfig {
        ServiceConfig {
            name: "probe-test".to_string(),
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            host: "0.0.0.0".to_string(),
            port,
            sweep_pattern: String::new(),
            readiness,
            env: BTreeMap::new(),
        }
    }

    /// Minimal HTTP responder: answers every connection with `status_line`.
    async fn serve(status_line: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                    status_line
                );
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        port
    }

    fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_port_free_detection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free(port));
        drop(listener);
        assert!(is_port_free(port));
    }

    #[test]
    fn test_probe_url_uses_loopback_for_wildcard() {
        let probe = Probe::for_service(&service_on(8000, Readiness::Http { path: "health".into() }));
        assert_eq!(probe.url().as_deref(), Some("http://127.0.0.1:8000/health"));

        let probe = Probe::for_service(&service_on(8000, Readiness::Tcp));
        assert_eq!(probe.url(), None);
    }

    #[tokio::test]
    async fn test_http_probe() {
        let ok = serve("200 OK").await;
        assert!(Probe::for_service(&service_on(ok, Readiness::Http { path: "/".into() })).check().await);

        let failing = serve("503 Service Unavailable").await;
        let probe = Probe::for_service(&service_on(failing, Readiness::Http { path: "/".into() }));
        assert!(!probe.check().await);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(Probe::for_service(&service_on(port, Readiness::Tcp)).check().await);

        drop(listener);
        assert!(!Probe::for_service(&service_on(port, Readiness::Tcp)).check().await);
    }

    #[tokio::test]
    async fn test_wait_for_port_free_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = wait_for_port_free(port, Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortInUse { port: p, .. } if p == port));

        drop(listener);
        wait_for_port_free(port, Duration::from_millis(300)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out() {
        let cfg = service_on(unused_port(), Readiness::Tcp);
        let mut svc = spawn_service(&cfg, std::path::Path::new("."), "PYTHONPATH").unwrap();

        let err = wait_for_ready(&mut svc, &Probe::for_service(&cfg), Duration::from_millis(600))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReadinessTimeout { .. }));

        svc.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_wait_for_ready_detects_early_exit() {
        let mut cfg = service_on(unused_port(), Readiness::Tcp);
        cfg.program = "false".to_string();
        cfg.args.clear();
        let mut svc = spawn_service(&cfg, std::path::Path::new("."), "PYTHONPATH").unwrap();

        let err = wait_for_ready(&mut svc, &Probe::for_service(&cfg), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedEarly { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_ready_with_server() {
        let port = serve("200 OK").await;
        let cfg = service_on(port, Readiness::Http { path: "/".into() });
        let mut svc = spawn_service(&cfg, std::path::Path::new("."), "PYTHONPATH").unwrap();

        wait_for_ready(&mut svc, &Probe::for_service(&cfg), Duration::from_secs(5))
            .await
            .unwrap();

        svc.terminate(Duration::from_secs(1)).await;
    }
}
