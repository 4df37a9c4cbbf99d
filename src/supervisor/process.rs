//! Service Process Management
//!
//! Environment setup, spawning, output forwarding and termination of the
//! supervised children, plus the name-pattern sweep for stale instances.

use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::config::ServiceConfig;
use crate::error::{Result, SupervisorError};

/// Append `entry` to a path-list value such as `PYTHONPATH`.
///
/// Existing entries keep their order; `entry` is not added twice.
pub fn extend_search_path(current: Option<&OsStr>, entry: &Path) -> OsString {
    let mut paths: Vec<PathBuf> = current
        .map(|value| std::env::split_paths(value).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default();

    if !paths.iter().any(|p| p == entry) {
        paths.push(entry.to_path_buf());
    }

    // Entries came from split_paths, so only `entry` could contain a separator.
    std::env::join_paths(&paths).unwrap_or_else(|_| {
        let mut raw = current.map(OsStr::to_os_string).unwrap_or_default();
        if !raw.is_empty() {
            raw.push(":");
        }
        raw.push(entry.as_os_str());
        raw
    })
}

/// Resolve the project directory to an absolute path when possible.
pub fn resolve_project_dir(dir: &Path) -> PathBuf {
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

/// Parse `pgrep` output into PIDs, skipping anything that is not a number.
pub fn parse_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// PIDs of processes whose command line matches `pattern`, excluding ourselves.
pub async fn find_matching_pids(pattern: &str) -> Vec<u32> {
    let output = match Command::new("pgrep")
        .args(["-f", pattern])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            log::debug!("[Supervisor] pgrep unavailable: {}", e);
            return Vec::new();
        }
    };

    other_pids(&output)
}

/// Blocking variant of `find_matching_pids` for `Drop` paths.
pub fn find_matching_pids_blocking(pattern: &str) -> Vec<u32> {
    match std::process::Command::new("pgrep")
        .args(["-f", pattern])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) => other_pids(&output),
        Err(e) => {
            log::debug!("[Supervisor] pgrep unavailable: {}", e);
            Vec::new()
        }
    }
}

/// PIDs from `pgrep` output, minus our own.
fn other_pids(output: &std::process::Output) -> Vec<u32> {
    // pgrep exits 1 when nothing matches
    if !output.status.success() {
        return Vec::new();
    }

    let own = std::process::id();
    parse_pids(&String::from_utf8_lossy(&output.stdout))
        .into_iter()
        .filter(|pid| *pid != own)
        .collect()
}

fn kill_all(pids: Vec<u32>, pattern: &str) -> usize {
    let mut killed = 0;
    for pid in pids {
        log::info!("[Supervisor] Killing stale process {} (matches '{}')", pid, pattern);
        if send_signal(pid, Signal::SIGKILL) {
            killed += 1;
        }
    }
    killed
}

/// Kill every process matching `pattern`. Returns how many were signalled.
///
/// Best effort: processes that vanish in between are ignored.
pub async fn sweep(pattern: &str) -> usize {
    if pattern.trim().is_empty() {
        return 0;
    }
    kill_all(find_matching_pids(pattern).await, pattern)
}

/// Blocking variant of `sweep`, with the same self-exclusion.
pub fn sweep_blocking(pattern: &str) -> usize {
    if pattern.trim().is_empty() {
        return 0;
    }
    kill_all(find_matching_pids_blocking(pattern), pattern)
}

/// Sweep the stale instances of every given service.
pub async fn sweep_services(services: &[&ServiceConfig]) -> usize {
    let mut killed = 0;
    for service in services {
        killed += sweep(&service.sweep_pattern).await;
    }
    killed
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Send a signal to a single process. Returns false if it no longer exists.
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            log::debug!("[Supervisor] kill({}, {:?}) failed: {}", pid, signal, e);
            false
        }
    }
}

/// Signal the process group led by `pid`, falling back to the process itself.
pub fn signal_group(pid: u32, signal: Signal) -> bool {
    let Some(group) = to_pid(pid) else {
        return false;
    };
    match killpg(group, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => send_signal(pid, signal),
        Err(e) => {
            log::debug!("[Supervisor] killpg({}, {:?}) failed: {}", pid, signal, e);
            send_signal(pid, signal)
        }
    }
}

/// Signal-0 probe. A zombie that has not been reaped still counts as alive.
pub fn process_alive(pid: u32) -> bool {
    to_pid(pid).is_some_and(|target| kill(target, None).is_ok())
}

/// Build the command for a service without spawning it.
pub fn build_command(
    service: &ServiceConfig,
    project_dir: &Path,
    search_path_var: &str,
) -> Command {
    let search_path = extend_search_path(std::env::var_os(search_path_var).as_deref(), project_dir);

    let mut std_cmd = std::process::Command::new(&service.program);
    std_cmd
        .args(service.resolved_args())
        .current_dir(project_dir)
        .env(search_path_var, search_path)
        .envs(&service.env)
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Own process group so reload workers die with the service
        .process_group(0);

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);
    cmd
}

/// A running, tracked child.
pub struct ManagedService {
    name: String,
    pid: u32,
    child: Child,
    output_tasks: Vec<JoinHandle<()>>,
}

impl ManagedService {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status if the child has already exited.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                log::warn!("[{}] Error checking process status: {}", self.name, e);
                None
            }
        }
    }

    /// Wait for the child to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Stop the service: SIGINT, then SIGTERM after half the grace period,
    /// then SIGKILL once the grace period is over.
    pub async fn terminate(&mut self, grace: Duration) {
        if let Some(status) = self.try_exit_status() {
            log::info!("[{}] Already exited ({})", self.name, status);
            return;
        }

        log::info!("[{}] Stopping (PID {})...", self.name, self.pid);
        signal_group(self.pid, Signal::SIGINT);

        let start = Instant::now();
        let mut escalated = false;

        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("[{}] Stopped ({})", self.name, status);
                    return;
                }
                Ok(None) => {
                    let elapsed = start.elapsed();
                    if elapsed >= grace {
                        break;
                    }
                    if !escalated && elapsed >= grace / 2 {
                        log::info!("[{}] Escalating to SIGTERM...", self.name);
                        signal_group(self.pid, Signal::SIGTERM);
                        escalated = true;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    log::warn!("[{}] Error checking process status: {}", self.name, e);
                    break;
                }
            }
        }

        log::info!("[{}] Grace period expired, force killing...", self.name);
        self.force_kill();
        if let Err(e) = self.child.wait().await {
            log::debug!("[{}] wait after kill failed: {}", self.name, e);
        }
    }

    /// Synchronous SIGKILL of the whole group. Does not reap.
    pub fn force_kill(&mut self) {
        signal_group(self.pid, Signal::SIGKILL);
        if let Err(e) = self.child.start_kill() {
            log::debug!("[{}] start_kill failed: {}", self.name, e);
        }
    }
}

impl Drop for ManagedService {
    fn drop(&mut self) {
        for task in self.output_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Spawn a service and start forwarding its output to the log.
pub fn spawn_service(
    service: &ServiceConfig,
    project_dir: &Path,
    search_path_var: &str,
) -> Result<ManagedService> {
    log::info!(
        "[{}] Launching: {} {}",
        service.name,
        service.program,
        service.resolved_args().join(" ")
    );
    log::debug!("[{}] Working directory: {}", service.name, project_dir.display());

    let mut child = build_command(service, project_dir, search_path_var)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            service: service.name.clone(),
            source,
        })?;

    // id() is only None after the child has been reaped
    let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
        service: service.name.clone(),
        source: std::io::Error::other("child exited before its PID could be read"),
    })?;

    let mut output_tasks = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        output_tasks.push(forward_output(service.name.clone(), stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        output_tasks.push(forward_output(service.name.clone(), stderr));
    }

    Ok(ManagedService {
        name: service.name.clone(),
        pid,
        child,
        output_tasks,
    })
}

/// Heuristic for child output lines worth logging at error level.
pub fn is_error_line(line: &str) -> bool {
    line.contains("ERROR") || line.contains("Traceback") || line.contains("Exception")
}

fn forward_output<R>(name: String, stream: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            if is_error_line(&line) {
                log::error!("[{}] {}", name, line);
            } else {
                log::info!("[{}] {}", name, line);
            }
        }
    })
}
