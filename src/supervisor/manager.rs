//! Supervisor
//!
//! Owns the backend and dashboard processes for one run: sweeps stale
//! instances, launches both in order, waits for a termination trigger and
//! tears everything down again.

use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::task::JoinHandle;
use tokio::time::interval;

use super::config::{ServiceConfig, SupervisorConfig};
use super::health::{wait_for_port_free, wait_for_ready, Probe};
use super::process::{
    resolve_project_dir, spawn_service, sweep_blocking, sweep_services, ManagedService,
};
use super::signal::{ShutdownReason, ShutdownSignals};
use crate::error::Result;

/// How long a swept port may take to be released.
const PORT_RELEASE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Supervisor state
pub struct Supervisor {
    config: SupervisorConfig,
    project_dir: PathBuf,
    /// Sweep stale instances before launching
    sweep_on_start: bool,
    backend: Option<ManagedService>,
    frontend: Option<ManagedService>,
    /// Periodic health logger, running between startup and shutdown
    monitor: Option<JoinHandle<()>>,
    /// Set once cleanup has run
    stopped: bool,
}

impl Supervisor {
    /// Create an idle supervisor.
    pub fn new(config: SupervisorConfig) -> Self {
        let project_dir = resolve_project_dir(&config.project_dir);
        Self {
            config,
            project_dir,
            sweep_on_start: true,
            backend: None,
            frontend: None,
            monitor: None,
            stopped: false,
        }
    }

    /// Skip the startup sweep (the shutdown sweep still runs).
    pub fn skip_startup_sweep(mut self) -> Self {
        self.sweep_on_start = false;
        self
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.backend.as_ref().map(ManagedService::pid)
    }

    pub fn frontend_pid(&self) -> Option<u32> {
        self.frontend.as_ref().map(ManagedService::pid)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Sweep for stale instances of both services.
    pub async fn sweep_all(&self) -> usize {
        sweep_services(&self.config.services()).await
    }

    /// Bring both services up, backend first.
    ///
    /// Each child is tracked the moment it is spawned, so a failure or a
    /// cancelled future here still leaves it for `shutdown` to reap.
    pub async fn start(&mut self) -> Result<()> {
        if self.backend.is_some() || self.frontend.is_some() {
            log::info!("[Supervisor] Already running");
            return Ok(());
        }

        if self.sweep_on_start {
            log::info!("[Supervisor] Cleaning up stale service processes...");
            let killed = self.sweep_all().await;
            if killed > 0 {
                log::info!("[Supervisor] Killed {} stale process(es)", killed);
            }
        }

        for service in self.config.services() {
            wait_for_port_free(service.port, PORT_RELEASE_TIMEOUT).await?;
        }

        let backend = self.config.backend.clone();
        let frontend = self.config.frontend.clone();

        self.backend = Some(self.launch(&backend)?);
        self.await_ready(&backend, true).await?;

        self.frontend = Some(self.launch(&frontend)?);
        self.await_ready(&frontend, false).await?;

        Ok(())
    }

    fn launch(&self, service: &ServiceConfig) -> Result<ManagedService> {
        let child = spawn_service(service, &self.project_dir, &self.config.search_path_var)?;
        log::info!("[{}] Spawned with PID {}", service.name, child.pid());
        Ok(child)
    }

    async fn await_ready(&mut self, service: &ServiceConfig, is_backend: bool) -> Result<()> {
        let timeout = self.config.startup_timeout();
        let slot = if is_backend { &mut self.backend } else { &mut self.frontend };
        let Some(child) = slot.as_mut() else {
            return Ok(());
        };
        wait_for_ready(child, &Probe::for_service(service), timeout).await
    }

    /// Print the service URLs and PIDs.
    pub fn print_status(&self) {
        let rows = [
            ("Backend API", &self.config.backend, self.backend_pid()),
            ("Dashboard", &self.config.frontend, self.frontend_pid()),
        ];
        for (label, service, pid) in rows {
            if let Some(pid) = pid {
                println!("{:<12} {} (PID: {})", format!("{}:", label), service.display_url(), pid);
            }
        }
        println!("Press Ctrl+C to stop all services");
    }

    fn start_health_monitor(&mut self) {
        let Some(period) = self.config.health_interval() else {
            return;
        };

        if let Some(previous) = self.monitor.take() {
            previous.abort();
        }

        let probes: Vec<(String, Probe)> = self
            .config
            .services()
            .iter()
            .map(|s| (s.name.clone(), Probe::for_service(s)))
            .collect();

        self.monitor = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            // First tick fires immediately; the services were just probed
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for (name, probe) in &probes {
                    if !probe.check().await {
                        log::warn!("[{}] Health check failed", name);
                    }
                }
            }
        }));
    }

    async fn wait_for_service_exit(&mut self) -> ShutdownReason {
        async fn exited(service: &mut ManagedService) -> (String, Option<ExitStatus>) {
            let status = service.wait().await.ok();
            (service.name().to_string(), status)
        }

        let (service, status) = match (self.backend.as_mut(), self.frontend.as_mut()) {
            (Some(backend), Some(frontend)) => tokio::select! {
                r = exited(backend) => r,
                r = exited(frontend) => r,
            },
            (Some(only), None) | (None, Some(only)) => exited(only).await,
            (None, None) => std::future::pending().await,
        };

        log::error!(
            "[{}] Exited unexpectedly{}",
            service,
            status.map(|s| format!(" ({})", s)).unwrap_or_default()
        );
        ShutdownReason::ServiceExited { service, status }
    }

    /// Block until a signal arrives or either service exits on its own.
    pub async fn wait_for_shutdown(&mut self, signals: &mut ShutdownSignals) -> ShutdownReason {
        self.start_health_monitor();

        tokio::select! {
            reason = signals.recv() => reason,
            reason = self.wait_for_service_exit() => reason,
        }
    }

    /// Start, then wait for a trigger. A signal during startup ends the run
    /// early. The caller must still call `shutdown`.
    pub async fn run(&mut self, signals: &mut ShutdownSignals) -> Result<ShutdownReason> {
        tokio::select! {
            started = self.start() => started?,
            reason = signals.recv() => return Ok(reason),
        }

        self.print_status();
        Ok(self.wait_for_shutdown(signals).await)
    }

    /// Terminate both services, then sweep as a safety net.
    ///
    /// Runs once; later calls return immediately.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        println!("Shutting down services...");

        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        let grace = self.config.shutdown_grace();

        // Reverse launch order: dashboard first
        if let Some(mut frontend) = self.frontend.take() {
            frontend.terminate(grace).await;
        }
        if let Some(mut backend) = self.backend.take() {
            backend.terminate(grace).await;
        }

        let swept = self.sweep_all().await;
        if swept > 0 {
            log::info!("[Supervisor] Swept {} leftover process(es)", swept);
        }

        println!("All services stopped");
    }

    /// Synchronous cleanup for paths that never reached `shutdown`.
    fn force_kill_internal(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        for mut service in [self.frontend.take(), self.backend.take()].into_iter().flatten() {
            log::warn!("[{}] Force killing (PID {})", service.name(), service.pid());
            service.force_kill();
        }

        for service in self.config.services() {
            sweep_blocking(&service.sweep_pattern);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.stopped && (self.backend.is_some() || self.frontend.is_some()) {
            self.stopped = true;
            self.force_kill_internal();
        }
    }
}
