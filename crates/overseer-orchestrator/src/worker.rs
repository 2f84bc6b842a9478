//! The seam between the engine and whatever runs worker processes.

use async_trait::async_trait;
use overseer_core::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A named recipe for launching a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The worker configurations agents may be created from, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ConfigCatalog {
    configs: Vec<AgentConfig>,
}

impl ConfigCatalog {
    /// Build a catalog, rejecting blank or duplicate names.
    pub fn new(configs: Vec<AgentConfig>) -> OverseerResult<Self> {
        for (i, config) in configs.iter().enumerate() {
            if config.name.trim().is_empty() {
                return Err(OverseerError::Config(format!(
                    "worker configuration #{i} has an empty name"
                )));
            }
            if configs[..i].iter().any(|c| c.name == config.name) {
                return Err(OverseerError::Config(format!(
                    "duplicate worker configuration '{}'",
                    config.name
                )));
            }
        }
        Ok(Self { configs })
    }

    pub fn get(&self, name: &str) -> Option<&AgentConfig> {
        self.configs.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.configs.iter().map(|c| c.name.clone()).collect()
    }

    pub fn configs(&self) -> &[AgentConfig] {
        &self.configs
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Opaque reference to a spawned worker, issued by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub agent_id: Uuid,
}

/// Notifications a supervisor pushes back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The worker process for `agent_id` ended. `normal` is true for a clean exit.
    Exited { agent_id: Uuid, normal: bool },
}

/// Launches and signals worker processes on behalf of the engine.
///
/// Calls are made outside the engine lock. Process exits are reported
/// asynchronously as [`SupervisorEvent::Exited`] on the channel the engine pumps,
/// including exits caused by `signal_stop` and `signal_terminate`.
#[async_trait]
pub trait WorkerSupervisor: Send + Sync {
    /// Prepare a worker for `agent_id`. Called once, before the first start.
    async fn spawn(&self, agent_id: Uuid, config: &AgentConfig) -> OverseerResult<WorkerHandle>;

    /// Launch (or relaunch) the worker process.
    async fn signal_start(&self, handle: &WorkerHandle) -> OverseerResult<()>;

    /// Ask the worker to stop. It may be started again later.
    async fn signal_stop(&self, handle: &WorkerHandle) -> OverseerResult<()>;

    /// Ask the worker to go away for good.
    async fn signal_terminate(&self, handle: &WorkerHandle) -> OverseerResult<()>;

    /// Forget a prepared worker whose agent no longer exists. Reports nothing.
    async fn release(&self, _handle: &WorkerHandle) -> OverseerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(name: &str) -> AgentConfig {
        AgentConfig {
            name: name.into(),
            command: "worker".into(),
            args: vec![],
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = ConfigCatalog::new(vec![config("claude"), config("codex")]).unwrap();
        assert!(catalog.contains("codex"));
        assert!(!catalog.contains("gpt"));
        assert_eq!(catalog.names(), vec!["claude", "codex"]);
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let err = ConfigCatalog::new(vec![config("claude"), config("claude")]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert!(ConfigCatalog::new(vec![config("  ")]).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let parsed: AgentConfig =
            serde_json::from_str(r#"{"name":"echo","command":"/bin/echo"}"#).unwrap();
        assert!(parsed.args.is_empty());
        assert!(parsed.env.is_empty());
    }
}
