//! Supervisor Configuration
//!
//! Built-in service definitions, the optional JSON settings file, and the
//! merge of the two. Every settings field is optional so a file only needs
//! to name what it changes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};

/// File name looked up in the project directory.
pub const PROJECT_SETTINGS_FILE: &str = "coach-supervisor.json";

/// How the supervisor decides a freshly spawned service is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Readiness {
    /// GET `path` on the service port answers with a 2xx status.
    Http { path: String },
    /// The service port accepts a TCP connection.
    Tcp,
    /// Blind settle delay; the service only has to stay alive this long.
    Delay { millis: u64 },
}

/// One long-running child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Short name used in log prefixes and status output.
    pub name: String,
    pub program: String,
    /// Arguments; `{host}` and `{port}` are substituted at launch.
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    /// Command-line fragment used to find stale instances (`pgrep -f`).
    pub sweep_pattern: String,
    pub readiness: Readiness,
    /// Extra environment variables for this service only.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// FastAPI server for the coaching API.
    pub fn default_backend() -> Self {
        Self {
            name: "backend".to_string(),
            program: "uvicorn".to_string(),
            args: ["app.main:app", "--host", "{host}", "--port", "{port}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            sweep_pattern: "uvicorn".to_string(),
            readiness: Readiness::Http { path: "/".to_string() },
            env: BTreeMap::new(),
        }
    }

    /// Streamlit dashboard.
    pub fn default_frontend() -> Self {
        Self {
            name: "dashboard".to_string(),
            program: "streamlit".to_string(),
            args: [
                "run",
                "app/frontend/main.py",
                "--server.port",
                "{port}",
                "--server.address",
                "{host}",
                "--server.headless",
                "true",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            host: "0.0.0.0".to_string(),
            port: 8501,
            sweep_pattern: "streamlit".to_string(),
            readiness: Readiness::Http { path: "/_stcore/health".to_string() },
            env: BTreeMap::new(),
        }
    }

    /// Arguments with placeholders filled in.
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{host}", &self.host).replace("{port}", &port))
            .collect()
    }

    /// Host to connect to when probing. Wildcard binds are probed on loopback.
    pub fn probe_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" | "[::]" => "::1",
            other => other,
        }
    }

    /// URL shown to the operator.
    pub fn display_url(&self) -> String {
        match self.host.as_str() {
            "0.0.0.0" | "" | "::" | "[::]" | "127.0.0.1" => {
                format!("http://localhost:{}", self.port)
            }
            other => format!("http://{}:{}", other, self.port),
        }
    }

    fn apply(&mut self, settings: ServiceSettings) {
        if let Some(name) = settings.name {
            self.name = name;
        }
        if let Some(program) = settings.program {
            self.program = program;
        }
        if let Some(args) = settings.args {
            self.args = args;
        }
        if let Some(host) = settings.host {
            self.host = host;
        }
        if let Some(port) = settings.port {
            self.port = port;
        }
        if let Some(pattern) = settings.sweep_pattern {
            self.sweep_pattern = pattern;
        }
        if let Some(readiness) = settings.readiness {
            self.readiness = readiness;
        }
        self.env.extend(settings.env);
    }
}

/// Effective supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorConfig {
    /// Application root: children run here and it is appended to the search path.
    pub project_dir: PathBuf,
    /// Path-list variable extended for the children.
    pub search_path_var: String,
    pub backend: ServiceConfig,
    pub frontend: ServiceConfig,
    pub startup_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Period of the steady-state health log; 0 disables it.
    pub health_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            search_path_var: "PYTHONPATH".to_string(),
            backend: ServiceConfig::default_backend(),
            frontend: ServiceConfig::default_frontend(),
            startup_timeout_secs: 30,
            shutdown_grace_secs: 5,
            health_interval_secs: 30,
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        match self.health_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Both services in launch order.
    pub fn services(&self) -> [&ServiceConfig; 2] {
        [&self.backend, &self.frontend]
    }

    /// Overlay a settings file on top of this configuration.
    pub fn apply(&mut self, settings: Settings) {
        if let Some(dir) = settings.project_dir {
            self.project_dir = dir;
        }
        if let Some(var) = settings.search_path_var {
            self.search_path_var = var;
        }
        if let Some(secs) = settings.startup_timeout_secs {
            self.startup_timeout_secs = secs;
        }
        if let Some(secs) = settings.shutdown_grace_secs {
            self.shutdown_grace_secs = secs;
        }
        if let Some(secs) = settings.health_interval_secs {
            self.health_interval_secs = secs;
        }
        if let Some(backend) = settings.backend {
            self.backend.apply(backend);
        }
        if let Some(frontend) = settings.frontend {
            self.frontend.apply(frontend);
        }
    }
}

/// Per-service overrides from the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSettings {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub sweep_pattern: Option<String>,
    #[serde(default)]
    pub readiness: Option<Readiness>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Settings file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
    #[serde(default)]
    pub search_path_var: Option<String>,
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    #[serde(default)]
    pub shutdown_grace_secs: Option<u64>,
    #[serde(default)]
    pub health_interval_secs: Option<u64>,
    #[serde(default)]
    pub backend: Option<ServiceSettings>,
    #[serde(default)]
    pub frontend: Option<ServiceSettings>,
}

impl Settings {
    /// Parse a settings file. Unlike the discovery step, a file that was
    /// found but cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| SupervisorError::Settings {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| SupervisorError::SettingsParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// User-level settings path (`~/.config/coach-supervisor/settings.json` on Linux).
pub fn user_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("coach-supervisor").join("settings.json"))
}

/// Locate the settings file to use, if any.
///
/// An explicit path wins and is returned even if missing so that loading
/// reports it. Otherwise the project file, then the user file, are used
/// when they exist.
pub fn find_settings_file(explicit: Option<&Path>, project_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let project = project_dir.join(PROJECT_SETTINGS_FILE);
    if project.is_file() {
        return Some(project);
    }

    user_settings_path().filter(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.backend.port, 8000);
        assert_eq!(config.frontend.port, 8501);
        assert_eq!(config.backend.sweep_pattern, "uvicorn");
        assert_eq!(config.frontend.sweep_pattern, "streamlit");
        assert_eq!(config.search_path_var, "PYTHONPATH");
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_resolved_args_substitutes_placeholders() {
        let backend = ServiceConfig::default_backend();
        assert_eq!(
            backend.resolved_args(),
            vec!["app.main:app", "--host", "0.0.0.0", "--port", "8000"]
        );

        let mut frontend = ServiceConfig::default_frontend();
        frontend.port = 9501;
        let args = frontend.resolved_args();
        assert!(args.windows(2).any(|w| w == ["--server.port", "9501"]));
    }

    #[test]
    fn test_probe_host_and_url() {
        let mut svc = ServiceConfig::default_backend();
        assert_eq!(svc.probe_host(), "127.0.0.1");
        assert_eq!(svc.display_url(), "http://localhost:8000");

        svc.host = "192.168.1.20".to_string();
        assert_eq!(svc.probe_host(), "192.168.1.20");
        assert_eq!(svc.display_url(), "http://192.168.1.20:8000");
    }

    #[test]
    fn test_partial_settings_override() {
        let json = r#"{
            "shutdown_grace_secs": 2,
            "health_interval_secs": 0,
            "backend": { "port": 9000, "env": { "DEBUG": "false" } },
            "frontend": { "readiness": { "kind": "tcp" } }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        let mut config = SupervisorConfig::default();
        config.apply(settings);

        assert_eq!(config.backend.port, 9000);
        assert_eq!(config.backend.program, "uvicorn");
        assert_eq!(config.backend.env.get("DEBUG").map(String::as_str), Some("false"));
        assert_eq!(config.frontend.readiness, Readiness::Tcp);
        assert_eq!(config.frontend.port, 8501);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
        assert_eq!(config.health_interval(), None);
        assert_eq!(config.startup_timeout_secs, 30);
    }

    #[test]
    fn test_readiness_delay_parses() {
        let r: Readiness = serde_json::from_str(r#"{"kind":"delay","millis":3000}"#).unwrap();
        assert_eq!(r, Readiness::Delay { millis: 3000 });
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = serde_json::from_str::<Settings>(r#"{"backend_port": 1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = Settings::load(file.path()).unwrap_err();
        match err {
            SupervisorError::SettingsParse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_find_settings_prefers_explicit_then_project() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("custom.json");
        assert_eq!(
            find_settings_file(Some(&explicit), dir.path()),
            Some(explicit.clone())
        );

        let project = dir.path().join(PROJECT_SETTINGS_FILE);
        fs::write(&project, "{}").unwrap();
        assert_eq!(find_settings_file(None, dir.path()), Some(project));
    }
}
