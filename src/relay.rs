//! Relay assembly: the worker fleet, its tools and the conversation loop.

use std::sync::Arc;

use axum::Router;

use crate::agent::{Agent, AgentDeps, chat_routes};
use crate::config::{AgentConfig, FleetConfig};
use crate::error::Result;
use crate::fleet::{TaskCorrelator, WorkerRegistry, WorkerSelector, WorkerStore, fleet_routes};
use crate::llm::LlmProvider;
use crate::tools::ToolRegistry;

/// Everything a running relay shares between its transports.
pub struct Relay {
    pub registry: Arc<WorkerRegistry>,
    pub correlator: Arc<TaskCorrelator>,
    pub tools: Arc<ToolRegistry>,
    pub agent: Arc<Agent>,
}

impl Relay {
    /// Validate configuration, load the worker directory and wire the parts.
    ///
    /// `llm` is `None` when no credentials are configured; chat then reports
    /// that instead of failing.
    pub async fn build(
        agent_config: AgentConfig,
        fleet_config: &FleetConfig,
        store: Arc<dyn WorkerStore>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self> {
        agent_config.validate()?;
        fleet_config.validate()?;

        let registry = Arc::new(WorkerRegistry::load(store).await?);
        let correlator = Arc::new(TaskCorrelator::new(
            Arc::clone(&registry),
            fleet_config.task_history,
            fleet_config.default_task_timeout,
        ));
        let selector = Arc::new(WorkerSelector::new(Arc::clone(&registry)));

        let tools = Arc::new(ToolRegistry::new());
        tools.register_fleet_tools(
            Arc::clone(&registry),
            selector,
            Arc::clone(&correlator),
        );

        let agent = Arc::new(Agent::new(
            agent_config,
            AgentDeps {
                llm,
                tools: Arc::clone(&tools),
            },
        ));

        Ok(Self {
            registry,
            correlator,
            tools,
            agent,
        })
    }

    /// Worker WebSocket, fleet inspection and chat routes.
    pub fn router(&self) -> Router {
        fleet_routes(Arc::clone(&self.registry), Arc::clone(&self.correlator))
            .merge(chat_routes(Arc::clone(&self.agent)))
    }

    /// Abandon every task still waiting on a worker. Returns how many.
    pub fn shutdown(&self) -> usize {
        let abandoned = self.correlator.shutdown();
        tracing::info!(abandoned, "Relay stopped");
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, Error};
    use crate::fleet::MemoryStore;

    #[tokio::test]
    async fn builds_with_fleet_tools() {
        let relay = Relay::build(
            AgentConfig::default(),
            &FleetConfig::default(),
            Arc::new(MemoryStore::new()),
            None,
        )
        .await
        .unwrap();

        assert_eq!(relay.tools.count(), 9);
        assert!(!relay.agent.is_configured());
        assert_eq!(relay.registry.count().await, 0);
        assert_eq!(relay.shutdown(), 0);
    }

    #[tokio::test]
    async fn invalid_config_is_reported() {
        let config = AgentConfig {
            max_rounds: 0,
            ..AgentConfig::default()
        };
        let result = Relay::build(
            config,
            &FleetConfig::default(),
            Arc::new(MemoryStore::new()),
            None,
        )
        .await;

        match result {
            Err(Error::Config(ConfigError::InvalidValue { key, .. })) => {
                assert_eq!(key, "RELAY_MAX_ROUNDS")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("zero rounds should be rejected"),
        }
    }

    #[tokio::test]
    async fn unreadable_directory_is_a_fleet_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = Relay::build(
            AgentConfig::default(),
            &FleetConfig::default(),
            Arc::new(crate::fleet::JsonFileStore::new(&path)),
            None,
        )
        .await;
        assert!(matches!(result, Err(Error::Fleet(_))));
    }
}
