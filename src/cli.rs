use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::supervisor::SupervisorConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Settings file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Application root; children run here and it is added to PYTHONPATH
    #[arg(short = 'C', long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub backend_port: Option<u16>,

    #[arg(long, global = true)]
    pub frontend_port: Option<u16>,

    /// Bind host for both services
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Launch both services and supervise them until interrupted (default)
    ///
    /// Ctrl+C, SIGTERM or SIGHUP stop both services and exit with status 0.
    /// If either service exits on its own, the other is stopped too and the
    /// supervisor exits with status 1. Services are never restarted.
    Up {
        /// Do not kill stale instances before launching
        #[arg(long)]
        skip_sweep: bool,
    },
    /// Kill stale backend and dashboard processes
    Stop,
    /// Report port, readiness and matching processes per service
    Status,
    /// Print the effective configuration as JSON
    Config,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Up { skip_sweep: false })
    }
}

impl GlobalArgs {
    /// Flags take precedence over the settings file.
    pub fn apply_overrides(&self, config: &mut SupervisorConfig) {
        if let Some(dir) = &self.project_dir {
            config.project_dir = dir.clone();
        }
        if let Some(port) = self.backend_port {
            config.backend.port = port;
        }
        if let Some(port) = self.frontend_port {
            config.frontend.port = port;
        }
        if let Some(host) = &self.host {
            config.backend.host = host.clone();
            config.frontend.host = host.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_up() {
        let cli = Cli::try_parse_from(["coach-supervisor"]).unwrap();
        assert_eq!(cli.command(), Commands::Up { skip_sweep: false });
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "coach-supervisor",
            "up",
            "--skip-sweep",
            "--backend-port",
            "9000",
            "--host",
            "127.0.0.1",
        ])
        .unwrap();
        assert_eq!(cli.command(), Commands::Up { skip_sweep: true });

        let mut config = SupervisorConfig::default();
        cli.global.apply_overrides(&mut config);
        assert_eq!(config.backend.port, 9000);
        assert_eq!(config.frontend.port, 8501);
        assert_eq!(config.frontend.host, "127.0.0.1");
    }

    #[test]
    fn test_up_help_documents_exit_status() {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        let up = cmd.find_subcommand_mut("up").unwrap();
        let help = up
            .render_long_help()
            .to_string()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        assert!(help.contains("exits with status 1"));
        assert!(help.contains("never restarted"));
    }

    #[test]
    fn test_rejects_bad_port() {
        assert!(Cli::try_parse_from(["coach-supervisor", "--frontend-port", "99999"]).is_err());
    }
}
