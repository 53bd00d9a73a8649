//! Assembly of the long-lived pieces from configuration.
//!
//! The store, registry and orchestrator are plain values built here and
//! handed to whichever surface drives them (HTTP gateway or CLI). Nothing
//! is global.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use switchboard_config::{AppConfig, ToolServersConfig};
use switchboard_core::error::ToolServerError;
use switchboard_core::event::{EventBus, spawn_tracing_sink};
use switchboard_core::inference::Inference;
use switchboard_servers::{
    ConnectReport, Connector, RetryPolicy, ToolServerEndpoint, ToolServerRegistry,
};
use switchboard_session::{SessionStore, SweeperHandle, spawn_sweeper};

use crate::query::QueryOrchestrator;

pub struct Runtime {
    pub config: AppConfig,
    pub event_bus: Arc<EventBus>,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<ToolServerRegistry>,
    pub orchestrator: Arc<QueryOrchestrator>,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
    sweeper: Option<SweeperHandle>,
}

impl Runtime {
    /// Wire everything together. Nothing runs until
    /// [`start_background`](Self::start_background) is called.
    pub fn build(
        config: AppConfig,
        inference: Arc<dyn Inference>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let sessions = Arc::new(
            SessionStore::new(config.session.ttl(), config.conversation.window_max_turns)
                .with_event_bus(event_bus.clone()),
        );
        let registry = Arc::new(
            ToolServerRegistry::new(connector)
                .with_call_timeout(config.tool_servers.call_timeout())
                .with_event_bus(event_bus.clone()),
        );
        let orchestrator = Arc::new(
            QueryOrchestrator::new(sessions.clone(), registry.clone(), inference)
                .with_inference_timeout(config.inference.timeout())
                .with_event_bus(event_bus.clone()),
        );

        Self {
            config,
            event_bus,
            sessions,
            registry,
            orchestrator,
            shutdown: CancellationToken::new(),
            background: Vec::new(),
            sweeper: None,
        }
    }

    /// Start the expiry sweeper and the event log sink.
    pub fn start_background(&mut self) {
        if self.sweeper.is_some() {
            return;
        }
        self.background.push(spawn_tracing_sink(&self.event_bus));
        self.sweeper = Some(spawn_sweeper(
            self.sessions.clone(),
            self.config.session.sweep_interval(),
            self.shutdown.child_token(),
        ));
    }

    /// Connect all configured tool servers.
    ///
    /// Degraded servers and total outage are logged; the runtime stays
    /// usable for tool-free queries either way.
    pub async fn connect_tool_servers(&self) -> Result<ConnectReport, ToolServerError> {
        let endpoints = endpoints(&self.config.tool_servers);
        if endpoints.is_empty() {
            info!("No tool servers configured");
            return Ok(ConnectReport::default());
        }

        let result = self
            .registry
            .connect_all(&endpoints, retry_policy(&self.config.tool_servers))
            .await;
        match &result {
            Ok(report) => {
                for degraded in &report.degraded {
                    warn!(server_id = %degraded.server_id, error = %degraded.error, "Tool server degraded");
                }
            }
            Err(e) => warn!(error = %e, "No tool servers available; continuing without tools"),
        }
        result
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background tasks and disconnect tool servers.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown().await;
        }
        self.registry.shutdown().await;
        for task in self.background.drain(..) {
            task.abort();
        }
        info!("Runtime stopped");
    }
}

pub fn endpoints(config: &ToolServersConfig) -> Vec<ToolServerEndpoint> {
    config
        .endpoints
        .iter()
        .map(|e| ToolServerEndpoint::new(&e.id, &e.url))
        .collect()
}

pub fn retry_policy(config: &ToolServersConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.max_attempts,
        retry_delay: config.retry_delay(),
        attempt_timeout: config.connect_timeout(),
    }
}
