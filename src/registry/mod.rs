//! Tool registry: alias maps, auto-discovery, and call dispatch.
//!
//! An alias is a short flat name that redirects to one namespaced backend
//! tool (`backendId:name`). Aliases come from two sources: explicit
//! operator-created entries and auto-discovery driven by wildcard rules.
//! All alias mutation happens under one registry-wide lock so cross-entry
//! uniqueness holds even for concurrent writers.

pub mod rules;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rmcp::model::{CallToolResult, Content};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::DiscoveryRule,
    core::ConnectionSupervisor,
    error::{BridgeError, BridgeResult},
};

/// Meta-operations served by the bridge itself rather than a backend.
const META_OPS: &[&str] = &[
    "list_tools",
    "get_tool_conflicts",
    "list_aliases",
    "create_alias",
    "remove_alias",
    "rename_alias",
    "apply_discovery_rules",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasSource {
    Explicit,
    AutoDiscovery,
}

#[derive(Debug, Clone, Serialize)]
pub struct AliasedTool {
    pub alias: String,
    pub namespaced_name: String,
    pub server_id: String,
    pub original_name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    pub source: AliasSource,
}

pub struct ToolRegistry {
    supervisor: Arc<ConnectionSupervisor>,
    aliases: DashMap<String, AliasedTool>,
    rules: RwLock<Vec<DiscoveryRule>>,
    /// Serializes alias mutation; uniqueness checks span entries.
    write_lock: Mutex<()>,
}

impl ToolRegistry {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, rules: Vec<DiscoveryRule>) -> Self {
        Self {
            supervisor,
            aliases: DashMap::new(),
            rules: RwLock::new(rules),
            write_lock: Mutex::new(()),
        }
    }

    /// Create an explicit alias for a namespaced tool.
    ///
    /// The target backend must be connected and must expose the tool.
    pub async fn create_alias(&self, alias: &str, namespaced_name: &str) -> BridgeResult<()> {
        validate_alias_name(alias)?;
        let (server_id, tool_name) = split_namespaced(namespaced_name)?;

        let _guard = self.write_lock.lock().await;

        if self.aliases.contains_key(alias) {
            return Err(BridgeError::DuplicateAlias(alias.to_string()));
        }

        let tools = self.supervisor.list_server_tools(&server_id).await?;
        let tool = tools
            .iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| BridgeError::ToolNotFound {
                server: server_id.clone(),
                tool: tool_name.clone(),
            })?;

        self.aliases.insert(
            alias.to_string(),
            AliasedTool {
                alias: alias.to_string(),
                namespaced_name: namespaced_name.to_string(),
                server_id,
                original_name: tool_name,
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
                source: AliasSource::Explicit,
            },
        );
        info!("Created alias '{}' -> '{}'", alias, namespaced_name);
        Ok(())
    }

    pub async fn remove_alias(&self, alias: &str) -> BridgeResult<()> {
        let _guard = self.write_lock.lock().await;
        self.aliases
            .remove(alias)
            .ok_or_else(|| BridgeError::AliasNotFound(alias.to_string()))?;
        info!("Removed alias '{}'", alias);
        Ok(())
    }

    /// Rename an explicit alias. Auto-discovered aliases cannot be renamed;
    /// the next discovery pass would recreate them under the old name.
    pub async fn rename_alias(&self, alias: &str, new_alias: &str) -> BridgeResult<()> {
        validate_alias_name(new_alias)?;
        let _guard = self.write_lock.lock().await;

        if self.aliases.contains_key(new_alias) {
            return Err(BridgeError::DuplicateAlias(new_alias.to_string()));
        }
        let entry = self
            .aliases
            .get(alias)
            .ok_or_else(|| BridgeError::AliasNotFound(alias.to_string()))?;
        if entry.source != AliasSource::Explicit {
            return Err(BridgeError::RenameForbidden(alias.to_string()));
        }
        drop(entry);

        if let Some((_, mut tool)) = self.aliases.remove(alias) {
            tool.alias = new_alias.to_string();
            self.aliases.insert(new_alias.to_string(), tool);
        }
        info!("Renamed alias '{}' -> '{}'", alias, new_alias);
        Ok(())
    }

    pub fn list_aliases(&self) -> Vec<AliasedTool> {
        let mut aliases: Vec<AliasedTool> =
            self.aliases.iter().map(|e| e.value().clone()).collect();
        aliases.sort_by(|a, b| a.alias.cmp(&b.alias));
        aliases
    }

    pub fn set_discovery_rules(&self, rules: Vec<DiscoveryRule>) {
        *self.rules.write() = rules;
    }

    /// All backend tools, namespaced, across connected backends.
    pub async fn list_tools(&self) -> Vec<crate::core::NamespacedTool> {
        self.supervisor.get_all_tools().await
    }

    /// Rebuild auto-discovered aliases from the current rules.
    ///
    /// Existing auto-discovered entries are dropped first; explicit aliases
    /// are never touched. A bare name claimed by an explicit alias or an
    /// earlier-processed tool is skipped. Backends that fail to list are
    /// logged and skipped. Returns the number of aliases created.
    pub async fn apply_discovery_rules(&self) -> usize {
        let _guard = self.write_lock.lock().await;
        let rules = self.rules.read().clone();

        self.aliases
            .retain(|_, tool| tool.source == AliasSource::Explicit);

        if rules.is_empty() {
            return 0;
        }

        let mut created = 0;
        for server_id in self.supervisor.get_available_servers() {
            let tools = match self.supervisor.list_server_tools(&server_id).await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!("Discovery skipping '{}': {}", server_id, e);
                    continue;
                }
            };

            for tool in tools {
                if !rules::should_discover(&rules, &server_id, &tool.name) {
                    continue;
                }
                if META_OPS.contains(&tool.name.as_str()) {
                    debug!("Discovery skipping reserved name '{}'", tool.name);
                    continue;
                }
                if self.aliases.contains_key(&tool.name) {
                    debug!(
                        "Discovery skipping '{}': name already taken",
                        tool.namespaced_name
                    );
                    continue;
                }
                self.aliases.insert(
                    tool.name.clone(),
                    AliasedTool {
                        alias: tool.name.clone(),
                        namespaced_name: tool.namespaced_name.clone(),
                        server_id: server_id.clone(),
                        original_name: tool.name,
                        description: tool.description,
                        input_schema: tool.input_schema,
                        source: AliasSource::AutoDiscovery,
                    },
                );
                created += 1;
            }
        }

        info!("Auto-discovery created {} aliases", created);
        created
    }

    /// Resolve a callable name to `(server_id, tool_name)`.
    ///
    /// Aliases win over the namespaced form; meta-op names resolve to none.
    pub fn resolve(&self, name: &str) -> Option<(String, String)> {
        if let Some(entry) = self.aliases.get(name) {
            return Some((entry.server_id.clone(), entry.original_name.clone()));
        }
        if META_OPS.contains(&name) {
            return None;
        }
        split_namespaced(name).ok()
    }

    /// Dispatch a call by alias, namespaced name, or meta-op name.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> BridgeResult<CallToolResult> {
        if let Some(entry) = self.aliases.get(name) {
            let (server_id, tool_name) =
                (entry.server_id.clone(), entry.original_name.clone());
            drop(entry);
            return self.supervisor.call_tool(&server_id, &tool_name, args).await;
        }

        if META_OPS.contains(&name) {
            return self.dispatch_meta(name, args).await;
        }

        if let Ok((server_id, tool_name)) = split_namespaced(name) {
            return self.supervisor.call_tool(&server_id, &tool_name, args).await;
        }

        Err(BridgeError::UnknownTool(name.to_string()))
    }

    async fn dispatch_meta(
        &self,
        name: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> BridgeResult<CallToolResult> {
        match name {
            "list_tools" => {
                let tools = self.list_tools().await;
                json_result(&tools)
            }
            "get_tool_conflicts" => {
                let conflicts = self.supervisor.get_tool_conflicts().await;
                json_result(&conflicts)
            }
            "list_aliases" => json_result(&self.list_aliases()),
            "create_alias" => {
                let alias = require_str(&args, "alias")?;
                let tool = require_str(&args, "tool")?;
                self.create_alias(&alias, &tool).await?;
                text_result(format!("alias '{}' created", alias))
            }
            "remove_alias" => {
                let alias = require_str(&args, "alias")?;
                self.remove_alias(&alias).await?;
                text_result(format!("alias '{}' removed", alias))
            }
            "rename_alias" => {
                let alias = require_str(&args, "alias")?;
                let new_alias = require_str(&args, "new_alias")?;
                self.rename_alias(&alias, &new_alias).await?;
                text_result(format!("alias '{}' renamed to '{}'", alias, new_alias))
            }
            "apply_discovery_rules" => {
                let created = self.apply_discovery_rules().await;
                text_result(format!("{} aliases created", created))
            }
            _ => Err(BridgeError::UnknownTool(name.to_string())),
        }
    }
}

fn validate_alias_name(alias: &str) -> BridgeResult<()> {
    if alias.trim().is_empty() {
        return Err(BridgeError::InvalidArguments(
            "alias must not be empty".to_string(),
        ));
    }
    if alias.contains(':') {
        return Err(BridgeError::InvalidArguments(format!(
            "alias '{}' must not contain ':'",
            alias
        )));
    }
    if META_OPS.contains(&alias) {
        return Err(BridgeError::InvalidArguments(format!(
            "alias '{}' is a reserved name",
            alias
        )));
    }
    Ok(())
}

fn split_namespaced(name: &str) -> BridgeResult<(String, String)> {
    match name.split_once(':') {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => {
            Ok((server.to_string(), tool.to_string()))
        }
        _ => Err(BridgeError::UnknownTool(name.to_string())),
    }
}

fn require_str(
    args: &Option<serde_json::Map<String, serde_json::Value>>,
    key: &str,
) -> BridgeResult<String> {
    args.as_ref()
        .and_then(|map| map.get(key))
        .and_then(|value| value.as_str())
        .map(String::from)
        .ok_or_else(|| {
            BridgeError::InvalidArguments(format!("missing string argument '{}'", key))
        })
}

fn json_result<T: Serialize>(value: &T) -> BridgeResult<CallToolResult> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| BridgeError::ToolExecution(format!("serialize result: {}", e)))?;
    Ok(CallToolResult::success(vec![Content::text(body)]))
}

fn text_result(message: String) -> BridgeResult<CallToolResult> {
    Ok(CallToolResult::success(vec![Content::text(message)]))
}
