//! Connection supervision and aggregation across backends.
//!
//! Owns the backend-id -> connection map and the per-connection status state
//! machine. Startup is best-effort: one backend failing to connect never
//! aborts fleet bring-up. Aggregated listings skip backends that fail to
//! answer instead of failing the whole operation.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, RawResource, ReadResourceRequestParam,
        ReadResourceResult,
    },
    service::ServiceError,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::RetrySchedule,
    connector::{self, BridgeClient},
};
use crate::{
    config::BackendConfig,
    error::{BridgeError, BridgeResult},
    events::{BridgeEvent, EventBus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Retrying,
    Failed,
}

/// Per-connection status record, updated through every state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl StatusInfo {
    fn connecting(max_retries: u32) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            retry_count: 0,
            max_retries,
            last_retry_time: None,
            next_retry_time: None,
            error_message: None,
        }
    }

    fn connected(max_retries: u32) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            ..Self::connecting(max_retries)
        }
    }

    fn failed(max_retries: u32, message: String) -> Self {
        Self {
            status: ConnectionStatus::Failed,
            error_message: Some(message),
            ..Self::connecting(max_retries)
        }
    }
}

pub(crate) struct ServerConnection {
    pub config: BackendConfig,
    pub client: Option<Arc<BridgeClient>>,
    pub status: StatusInfo,
}

impl ServerConnection {
    fn is_connected(&self) -> bool {
        self.status.status == ConnectionStatus::Connected && self.client.is_some()
    }
}

/// A backend tool tagged with its namespaced name (`backendId:name`).
#[derive(Debug, Clone, Serialize)]
pub struct NamespacedTool {
    pub name: String,
    pub namespaced_name: String,
    pub server_id: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// A bare tool name exposed by more than one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolConflict {
    pub tool_name: String,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedServerInfo {
    pub server_id: String,
    pub transport: &'static str,
    pub status: StatusInfo,
    pub tool_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub known_servers: usize,
    pub connected_servers: usize,
    pub total_calls: u64,
    pub failed_calls: u64,
}

#[derive(Default)]
struct Counters {
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
}

pub struct ConnectionSupervisor {
    connections: Arc<DashMap<String, ServerConnection>>,
    events: Arc<EventBus>,
    counters: Counters,
    shutdown_token: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            events,
            counters: Counters::default(),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Connect every enabled backend. Failures are logged and skipped.
    pub async fn initialize(&self, configs: &[BackendConfig]) {
        for config in configs.iter().filter(|c| c.enabled) {
            self.establish(config.clone()).await;
        }

        if self.get_available_servers().is_empty() {
            info!("No backends connected");
        }
    }

    /// Connect one backend, recording the outcome in the connection map.
    async fn establish(&self, config: BackendConfig) -> bool {
        let server_id = config.id.clone();
        let max_retries = config.max_retries;

        self.connections.insert(
            server_id.clone(),
            ServerConnection {
                config: config.clone(),
                client: None,
                status: StatusInfo::connecting(max_retries),
            },
        );

        match connector::connect(&config).await {
            Ok(client) => {
                if let Some(mut entry) = self.connections.get_mut(&server_id) {
                    entry.client = Some(Arc::new(client));
                    entry.status = StatusInfo::connected(max_retries);
                }
                self.events.emit(BridgeEvent::ServerConnected {
                    server_id: server_id.clone(),
                });
                info!("Backend '{}' connected", server_id);
                true
            }
            Err(e) => {
                error!("Failed to connect backend '{}': {}", server_id, e);
                if let Some(mut entry) = self.connections.get_mut(&server_id) {
                    entry.status = StatusInfo::failed(max_retries, e.to_string());
                }
                false
            }
        }
    }

    /// Ids of backends currently connected, sorted.
    pub fn get_available_servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.is_connected())
            .map(|e| e.key().clone())
            .collect();
        servers.sort();
        servers
    }

    fn connected_client(
        &self,
        server_id: &str,
    ) -> BridgeResult<(Arc<BridgeClient>, Duration)> {
        let entry = self
            .connections
            .get(server_id)
            .ok_or_else(|| BridgeError::ServerNotConnected(server_id.to_string()))?;
        if !entry.is_connected() {
            return Err(BridgeError::ServerNotConnected(server_id.to_string()));
        }
        let client = entry
            .client
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| BridgeError::ServerNotConnected(server_id.to_string()))?;
        let timeout = Duration::from_secs(entry.config.timeout_secs);
        Ok((client, timeout))
    }

    /// Forward a tool call to a connected backend.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> BridgeResult<CallToolResult> {
        let (client, timeout) = self.connected_client(server_id)?;
        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);

        let request = CallToolRequestParam {
            name: Cow::Owned(tool_name.to_string()),
            arguments: args,
        };

        let result = tokio::time::timeout(timeout, client.call_tool(request)).await;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
                self.handle_call_failure(server_id, &e);
                Err(BridgeError::ToolExecution(format!(
                    "call '{}' on '{}': {}",
                    tool_name, server_id, e
                )))
            }
            Err(_) => {
                self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
                Err(BridgeError::ToolExecution(format!(
                    "call '{}' on '{}' timed out after {:?}",
                    tool_name, server_id, timeout
                )))
            }
        }
    }

    /// List the tools one connected backend exposes, namespaced.
    pub async fn list_server_tools(&self, server_id: &str) -> BridgeResult<Vec<NamespacedTool>> {
        let (client, timeout) = self.connected_client(server_id)?;

        let tools = tokio::time::timeout(timeout, client.peer().list_all_tools())
            .await
            .map_err(|_| {
                BridgeError::Transport(format!("list tools on '{}' timed out", server_id))
            })?
            .map_err(|e| {
                self.handle_call_failure(server_id, &e);
                BridgeError::Transport(format!("list tools on '{}': {}", server_id, e))
            })?;

        Ok(tools
            .into_iter()
            .map(|t| NamespacedTool {
                namespaced_name: format!("{}:{}", server_id, t.name),
                name: t.name.to_string(),
                server_id: server_id.to_string(),
                description: t.description.as_ref().map(|d| d.to_string()),
                input_schema: serde_json::Value::Object((*t.input_schema).clone()),
            })
            .collect())
    }

    /// Aggregate tools across every connected backend. A backend that fails
    /// to answer is logged and skipped.
    pub async fn get_all_tools(&self) -> Vec<NamespacedTool> {
        let mut all = Vec::new();
        for server_id in self.get_available_servers() {
            match self.list_server_tools(&server_id).await {
                Ok(mut tools) => all.append(&mut tools),
                Err(e) => warn!("Skipping tools from '{}': {}", server_id, e),
            }
        }
        all
    }

    /// Bare tool names exposed by more than one backend.
    pub async fn get_tool_conflicts(&self) -> Vec<ToolConflict> {
        conflicts_from(&self.get_all_tools().await)
    }

    pub async fn list_resources(&self, server_id: &str) -> BridgeResult<Vec<RawResource>> {
        let (client, timeout) = self.connected_client(server_id)?;

        let resources = tokio::time::timeout(timeout, client.peer().list_all_resources())
            .await
            .map_err(|_| {
                BridgeError::Transport(format!("list resources on '{}' timed out", server_id))
            })?
            .map_err(|e| {
                self.handle_call_failure(server_id, &e);
                BridgeError::Transport(format!("list resources on '{}': {}", server_id, e))
            })?;

        Ok(resources.into_iter().map(|r| r.raw).collect())
    }

    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> BridgeResult<ReadResourceResult> {
        let (client, timeout) = self.connected_client(server_id)?;

        let request = ReadResourceRequestParam {
            uri: uri.to_string(),
        };

        tokio::time::timeout(timeout, client.read_resource(request))
            .await
            .map_err(|_| {
                BridgeError::Transport(format!("read resource on '{}' timed out", server_id))
            })?
            .map_err(|e| {
                self.handle_call_failure(server_id, &e);
                BridgeError::Transport(format!("read '{}' on '{}': {}", uri, server_id, e))
            })
    }

    /// Reconcile against a new configuration: removed backends disconnect,
    /// transport-changed backends reconnect, new backends connect. Applied
    /// strictly in that order.
    pub async fn update_configuration(&self, new_configs: &[BackendConfig]) {
        let new_enabled: HashMap<String, BackendConfig> = new_configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (c.id.clone(), c.clone()))
            .collect();

        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|e| !new_enabled.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for server_id in stale {
            self.disconnect_backend(&server_id, "removed from configuration")
                .await;
        }

        let mut reconnect = Vec::new();
        let mut add = Vec::new();
        for (server_id, config) in &new_enabled {
            // Decide while holding only the read guard, then drop it before
            // taking the write guard: holding both on the same key deadlocks.
            let existing_needs_reconnect = self
                .connections
                .get(server_id)
                .map(|existing| existing.config.needs_reconnect(config));
            match existing_needs_reconnect {
                Some(true) => {
                    reconnect.push(config.clone());
                }
                Some(false) => {
                    // Timeout or retry-policy changes apply in place.
                    if let Some(mut entry) = self.connections.get_mut(server_id) {
                        entry.config = config.clone();
                        entry.status.max_retries = config.max_retries;
                    }
                }
                None => add.push(config.clone()),
            }
        }

        for config in reconnect {
            debug!("Backend '{}' transport changed, reconnecting", config.id);
            self.disconnect_backend(&config.id, "configuration changed")
                .await;
            self.establish(config).await;
        }

        for config in add {
            self.establish(config).await;
        }
    }

    /// Retry a backend with a fresh connection. A still-connected backend
    /// is closed first so its running service is cancelled, not leaked.
    pub async fn force_retry(&self, server_id: &str) -> BridgeResult<()> {
        let (config, connected) = self
            .connections
            .get(server_id)
            .map(|e| (e.config.clone(), e.is_connected()))
            .ok_or_else(|| BridgeError::ServerNotConnected(server_id.to_string()))?;

        if connected {
            self.disconnect_backend(server_id, "forced reconnect").await;
        }

        if self.establish(config).await {
            Ok(())
        } else {
            Err(BridgeError::Connection(format!(
                "retry for '{}' failed",
                server_id
            )))
        }
    }

    /// Retry every backend that is not currently connected. Individual
    /// failures are logged, not propagated.
    pub async fn force_retry_all(&self) {
        let candidates: Vec<String> = self
            .connections
            .iter()
            .filter(|e| !e.is_connected())
            .map(|e| e.key().clone())
            .collect();

        for server_id in candidates {
            if let Err(e) = self.force_retry(&server_id).await {
                warn!("Force retry for '{}' failed: {}", server_id, e);
            }
        }
    }

    /// Status and tool-count detail for every known backend.
    pub async fn get_detailed_server_info(&self) -> Vec<DetailedServerInfo> {
        let known: Vec<(String, &'static str, StatusInfo, bool)> = self
            .connections
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.config.transport.kind(),
                    e.status.clone(),
                    e.is_connected(),
                )
            })
            .collect();

        let mut infos = Vec::with_capacity(known.len());
        for (server_id, transport, status, connected) in known {
            let tool_count = if connected {
                self.list_server_tools(&server_id).await.ok().map(|t| t.len())
            } else {
                None
            };
            infos.push(DetailedServerInfo {
                server_id,
                transport,
                status,
                tool_count,
            });
        }
        infos.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        infos
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            known_servers: self.connections.len(),
            connected_servers: self
                .connections
                .iter()
                .filter(|e| e.is_connected())
                .count(),
            total_calls: self.counters.total_calls.load(Ordering::Relaxed),
            failed_calls: self.counters.failed_calls.load(Ordering::Relaxed),
        }
    }

    /// Transport-class call failures flip the state machine to disconnected
    /// and schedule the retry loop; backend-side tool errors do not.
    fn handle_call_failure(&self, server_id: &str, error: &ServiceError) {
        if !is_transport_failure(error) {
            return;
        }
        let message = error.to_string();

        let should_retry = {
            match self.connections.get_mut(server_id) {
                Some(mut entry) if entry.status.status == ConnectionStatus::Connected => {
                    entry.client = None;
                    entry.status.status = ConnectionStatus::Disconnected;
                    entry.status.error_message = Some(message.clone());
                    true
                }
                _ => false,
            }
        };

        if should_retry {
            warn!("Backend '{}' disconnected: {}", server_id, message);
            self.events.emit(BridgeEvent::ServerDisconnected {
                server_id: server_id.to_string(),
                reason: message,
            });
            tokio::spawn(run_retry_loop(
                Arc::clone(&self.connections),
                Arc::clone(&self.events),
                self.shutdown_token.child_token(),
                server_id.to_string(),
            ));
        }
    }

    async fn disconnect_backend(&self, server_id: &str, reason: &str) {
        if let Some((_, connection)) = self.connections.remove(server_id) {
            if let Some(client) = connection.client {
                match Arc::try_unwrap(client) {
                    Ok(client) => {
                        if let Err(e) = client.cancel().await {
                            warn!("Error closing backend '{}': {}", server_id, e);
                        }
                    }
                    Err(_) => {
                        warn!(
                            "Backend '{}' client still in use at disconnect",
                            server_id
                        );
                    }
                }
            }
            info!("Backend '{}' disconnected: {}", server_id, reason);
            self.events.emit(BridgeEvent::ServerDisconnected {
                server_id: server_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Disconnect everything and stop retry tasks.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for server_id in ids {
            self.disconnect_backend(&server_id, "shutdown").await;
        }
    }
}

/// Group aggregated tools by bare name; any name exposed by more than one
/// distinct backend is a conflict.
fn conflicts_from(tools: &[NamespacedTool]) -> Vec<ToolConflict> {
    let mut by_name: HashMap<&str, Vec<&str>> = HashMap::new();
    for tool in tools {
        let servers = by_name.entry(&tool.name).or_default();
        if !servers.contains(&tool.server_id.as_str()) {
            servers.push(&tool.server_id);
        }
    }

    let mut conflicts: Vec<ToolConflict> = by_name
        .into_iter()
        .filter(|(_, servers)| servers.len() > 1)
        .map(|(name, mut servers)| {
            servers.sort();
            ToolConflict {
                tool_name: name.to_string(),
                servers: servers.into_iter().map(String::from).collect(),
            }
        })
        .collect();
    conflicts.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
    conflicts
}

/// Backend tool errors arrive as `McpError` responses and leave the
/// connection alone; every other service error means the transport
/// itself failed.
fn is_transport_failure(error: &ServiceError) -> bool {
    !matches!(error, ServiceError::McpError(_))
}

/// Drives disconnected -> retrying -> connected | failed with exponential
/// backoff. Exits early if the backend is removed by reconciliation.
async fn run_retry_loop(
    connections: Arc<DashMap<String, ServerConnection>>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    server_id: String,
) {
    let config = match connections.get(&server_id) {
        Some(entry) => entry.config.clone(),
        None => return,
    };
    let schedule = RetrySchedule::from_config(&config);

    for attempt in 1..=config.max_retries {
        let delay = schedule.delay_for(attempt);
        match connections.get_mut(&server_id) {
            Some(mut entry) => {
                entry.status.status = ConnectionStatus::Retrying;
                entry.status.retry_count = attempt;
                entry.status.next_retry_time =
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            }
            None => return,
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        match connector::connect(&config).await {
            Ok(client) => match connections.get_mut(&server_id) {
                Some(mut entry) => {
                    entry.client = Some(Arc::new(client));
                    entry.status = StatusInfo::connected(config.max_retries);
                    info!(
                        "Backend '{}' reconnected on attempt {}",
                        server_id, attempt
                    );
                    events.emit(BridgeEvent::ServerConnected {
                        server_id: server_id.clone(),
                    });
                    return;
                }
                None => return,
            },
            Err(e) => {
                warn!(
                    "Reconnect attempt {} for '{}' failed: {}",
                    attempt, server_id, e
                );
                match connections.get_mut(&server_id) {
                    Some(mut entry) => {
                        entry.status.last_retry_time = Some(Utc::now());
                        entry.status.error_message = Some(e.to_string());
                    }
                    None => return,
                }
            }
        }
    }

    if let Some(mut entry) = connections.get_mut(&server_id) {
        entry.status.status = ConnectionStatus::Failed;
        error!(
            "Backend '{}' failed after {} reconnect attempts",
            server_id, config.max_retries
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;
    use crate::config::TransportConfig;

    fn test_supervisor() -> ConnectionSupervisor {
        ConnectionSupervisor::new(Arc::new(EventBus::new()))
    }

    fn stdio_config(id: &str, command: &str) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: vec![],
                env: StdHashMap::new(),
                cwd: None,
            },
            enabled: true,
            timeout_secs: 5,
            max_retries: 2,
            retry_backoff_ms: 10,
            resources: None,
        }
    }

    fn tool(name: &str, server: &str) -> NamespacedTool {
        NamespacedTool {
            name: name.to_string(),
            namespaced_name: format!("{}:{}", server, name),
            server_id: server.to_string(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn call_tool_on_unknown_backend_is_not_connected() {
        let supervisor = test_supervisor();
        match supervisor.call_tool("ghost", "read", None).await {
            Err(BridgeError::ServerNotConnected(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected ServerNotConnected, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn failed_backend_is_not_available() {
        let supervisor = test_supervisor();
        // Nonexistent binary: connect fails, entry is kept with failed status.
        supervisor
            .initialize(&[stdio_config("bad", "/nonexistent/mcp-server")])
            .await;

        assert!(supervisor.get_available_servers().is_empty());
        let info = supervisor.get_detailed_server_info().await;
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].status.status, ConnectionStatus::Failed);
        assert!(info[0].status.error_message.is_some());
        assert!(info[0].tool_count.is_none());

        match supervisor.call_tool("bad", "read", None).await {
            Err(BridgeError::ServerNotConnected(_)) => {}
            other => panic!("expected ServerNotConnected, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn disabled_backends_are_skipped_on_initialize() {
        let supervisor = test_supervisor();
        let mut config = stdio_config("off", "/nonexistent/mcp-server");
        config.enabled = false;
        supervisor.initialize(&[config]).await;
        assert_eq!(supervisor.stats().known_servers, 0);
    }

    #[tokio::test]
    async fn reconciliation_removes_stale_backends() {
        let supervisor = test_supervisor();
        supervisor
            .initialize(&[stdio_config("old", "/nonexistent/mcp-server")])
            .await;
        assert_eq!(supervisor.stats().known_servers, 1);

        supervisor.update_configuration(&[]).await;
        assert_eq!(supervisor.stats().known_servers, 0);
    }

    #[tokio::test]
    async fn reconciliation_ignores_timeout_only_changes() {
        let supervisor = test_supervisor();
        supervisor
            .initialize(&[stdio_config("fs", "/nonexistent/mcp-server")])
            .await;

        let mut updated = stdio_config("fs", "/nonexistent/mcp-server");
        updated.timeout_secs = 120;
        supervisor.update_configuration(&[updated]).await;

        let entry = supervisor.connections.get("fs").unwrap();
        assert_eq!(entry.config.timeout_secs, 120);
        // Still the original failed attempt; no reconnect happened.
        assert_eq!(entry.status.status, ConnectionStatus::Failed);
    }

    #[tokio::test]
    async fn force_retry_unknown_backend_errors() {
        let supervisor = test_supervisor();
        match supervisor.force_retry("ghost").await {
            Err(BridgeError::ServerNotConnected(_)) => {}
            other => panic!("expected ServerNotConnected, got {:?}", other),
        }
    }

    #[test]
    fn conflicts_group_by_bare_name() {
        let tools = vec![
            tool("read", "fs"),
            tool("read", "fs2"),
            tool("write", "fs"),
        ];
        let conflicts = conflicts_from(&tools);
        assert_eq!(
            conflicts,
            vec![ToolConflict {
                tool_name: "read".to_string(),
                servers: vec!["fs".to_string(), "fs2".to_string()],
            }]
        );
    }

    #[test]
    fn conflicts_dedupe_repeated_servers() {
        let tools = vec![tool("read", "fs"), tool("read", "fs")];
        assert!(conflicts_from(&tools).is_empty());
    }

    #[test]
    fn transport_failures_are_distinguished_from_tool_errors() {
        assert!(is_transport_failure(&ServiceError::TransportClosed));
        // A tool reporting its own failure, even one worded like a
        // network problem, is not a transport loss.
        let tool_error = ServiceError::McpError(rmcp::model::ErrorData::internal_error(
            "database connection refused",
            None,
        ));
        assert!(!is_transport_failure(&tool_error));
    }

    #[tokio::test]
    async fn force_retry_does_not_report_phantom_disconnects() {
        let events = Arc::new(EventBus::new());
        let supervisor = ConnectionSupervisor::new(Arc::clone(&events));
        supervisor
            .initialize(&[stdio_config("bad", "/nonexistent/mcp-server")])
            .await;
        let mut rx = events.subscribe();

        // The backend never connected, so a retry must not announce a
        // disconnect for it.
        assert!(supervisor.force_retry("bad").await.is_err());
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, BridgeEvent::ServerDisconnected { .. }));
        }
    }
}
