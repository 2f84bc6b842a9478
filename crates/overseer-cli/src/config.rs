//! `overseer.toml` loading.

use overseer_core::{OverseerError, OverseerResult};
use overseer_orchestrator::{AgentConfig, AssignmentMode, EngineSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
pub struct OverseerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub workers: Vec<AgentConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL workers use to reach the server. Derived from host and port when unset.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
        }
    }
}

impl ServerConfig {
    pub fn public_url(&self) -> String {
        if let Some(url) = &self.public_url {
            return url.trim_end_matches('/').to_string();
        }
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("ws://{host}:{}", self.port)
    }
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub default_mode: AssignmentMode,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
    #[serde(default = "default_observer_queue")]
    pub observer_queue: usize,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_workspace_count")]
    pub workspace_count: usize,
    #[serde(default = "default_workdir_root")]
    pub workdir_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_mode: AssignmentMode::default(),
            stop_timeout_ms: default_stop_timeout_ms(),
            terminate_timeout_ms: default_terminate_timeout_ms(),
            observer_queue: default_observer_queue(),
            workspace_root: default_workspace_root(),
            workspace_count: default_workspace_count(),
            workdir_root: default_workdir_root(),
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            default_mode: self.default_mode,
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            terminate_timeout: Duration::from_millis(self.terminate_timeout_ms),
            observer_queue: self.observer_queue,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_stop_timeout_ms() -> u64 {
    10_000
}
fn default_terminate_timeout_ms() -> u64 {
    5_000
}
fn default_observer_queue() -> usize {
    256
}
fn default_workspace_root() -> PathBuf {
    PathBuf::from("./workspaces")
}
fn default_workspace_count() -> usize {
    4
}
fn default_workdir_root() -> PathBuf {
    PathBuf::from("./agents")
}

impl OverseerConfig {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> OverseerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OverseerError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::parse(&raw).map_err(|e| match e {
            OverseerError::Config(msg) => {
                OverseerError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(raw: &str) -> OverseerResult<Self> {
        toml::from_str(raw).map_err(|e| OverseerError::Config(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply() {
        let config = OverseerConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.server.public_url(), "ws://127.0.0.1:8765");
        assert_eq!(config.engine.default_mode, AssignmentMode::Auto);
        assert_eq!(config.engine.workspace_count, 4);
        assert!(config.workers.is_empty());

        let settings = config.engine.settings();
        assert_eq!(settings.stop_timeout, Duration::from_secs(10));
        assert_eq!(settings.terminate_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_full_file() {
        let raw = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            public_url = "ws://overseer.internal:9000/"

            [engine]
            default_mode = "manual"
            stop_timeout_ms = 250
            workspace_count = 2

            [[workers]]
            name = "claude"
            command = "claude-worker"
            args = ["--verbose"]
            env = { RUST_LOG = "debug" }

            [[workers]]
            name = "echo"
            command = "/bin/echo"
        "#;
        let config = OverseerConfig::parse(raw).unwrap();
        assert_eq!(config.server.public_url(), "ws://overseer.internal:9000");
        assert_eq!(config.engine.default_mode, AssignmentMode::Manual);
        assert_eq!(
            config.engine.settings().stop_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].args, vec!["--verbose"]);
        assert_eq!(config.workers[0].env["RUST_LOG"], "debug");
        assert!(config.workers[1].args.is_empty());
    }

    #[test]
    fn test_missing_file_names_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("absent.toml");
        let err = OverseerConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_invalid_file_names_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("overseer.toml");
        std::fs::write(&path, "[engine]\ndefault_mode = \"sometimes\"\n").unwrap();
        let err = OverseerConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("overseer.toml"));
    }
}
