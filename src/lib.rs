//! Local supervisor for the AI coach platform: runs the FastAPI backend and
//! the Streamlit dashboard side by side and guarantees both are gone when
//! it stops.

use anyhow::Context;

pub mod cli;
pub mod error;
pub mod supervisor;

use cli::{Cli, Commands};
use supervisor::config::{find_settings_file, Settings};
use supervisor::health::{is_port_free, Probe};
use supervisor::process::{find_matching_pids, sweep_services};
use supervisor::{ShutdownSignals, Supervisor, SupervisorConfig};

/// Defaults, then the settings file, then command-line flags.
pub fn load_config(cli: &Cli) -> anyhow::Result<SupervisorConfig> {
    let mut config = SupervisorConfig::default();

    let project_dir = cli
        .global
        .project_dir
        .clone()
        .unwrap_or_else(|| config.project_dir.clone());

    if let Some(path) = find_settings_file(cli.global.config.as_deref(), &project_dir) {
        log::info!("[Startup] Settings: {}", path.display());
        let settings = Settings::load(&path)?;
        config.apply(settings);
    }

    cli.global.apply_overrides(&mut config);
    Ok(config)
}

/// Run the selected command. Returns the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli).context("failed to load configuration")?;

    match cli.command() {
        Commands::Up { skip_sweep } => run_up(config, skip_sweep).await,
        Commands::Stop => {
            let killed = sweep_services(&config.services()).await;
            println!("Stopped {} process(es)", killed);
            Ok(0)
        }
        Commands::Status => {
            print_service_status(&config).await;
            Ok(0)
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(0)
        }
    }
}

async fn run_up(config: SupervisorConfig, skip_sweep: bool) -> anyhow::Result<i32> {
    let mut signals = ShutdownSignals::install()?;

    let mut supervisor = Supervisor::new(config);
    if skip_sweep {
        supervisor = supervisor.skip_startup_sweep();
    }

    let outcome = supervisor.run(&mut signals).await;
    supervisor.shutdown().await;

    let reason = outcome.context("failed to start services")?;
    log::info!("[Supervisor] Stopped: {}", reason);
    Ok(reason.exit_code())
}

async fn print_service_status(config: &SupervisorConfig) {
    for service in config.services() {
        let listening = !is_port_free(service.port);
        let ready = Probe::for_service(service).check().await;
        let pids = find_matching_pids(&service.sweep_pattern).await;

        println!("{} ({})", service.name, service.display_url());
        println!("  port {}: {}", service.port, if listening { "in use" } else { "free" });
        println!("  ready: {}", if listening && ready { "yes" } else { "no" });
        if pids.is_empty() {
            println!("  processes: none");
        } else {
            let list: Vec<String> = pids.iter().map(u32::to_string).collect();
            println!("  processes: {}", list.join(", "));
        }
    }
}
