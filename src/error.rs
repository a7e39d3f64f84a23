//! Bridge error types.
//!
//! Defines error variants for connection, registry, and instance lifecycle
//! operations.

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Server not connected: {0}")]
    ServerNotConnected(String),

    #[error("Tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Alias already registered: {0}")]
    DuplicateAlias(String),

    #[error("Alias not found: {0}")]
    AliasNotFound(String),

    #[error("Alias '{0}' was created by discovery rules and cannot be renamed")]
    RenameForbidden(String),

    #[error("Instance limit exceeded for '{user}': {current} of {max}")]
    InstanceLimitExceeded {
        user: String,
        current: usize,
        max: usize,
    },

    #[error("Resource quota exceeded for '{user}': {detail}")]
    ResourceQuotaExceeded { user: String, detail: String },

    #[error("Lifecycle mode '{mode}' not allowed for '{user}'")]
    LifecycleModeForbidden { user: String, mode: String },

    #[error("Process spawn confirmation timed out after {0} seconds")]
    ProcessSpawnTimeout(u64),

    #[error("Process spawn failed: {0}")]
    ProcessSpawn(String),

    #[error("Process stop failed: {0}")]
    ProcessStop(String),

    #[error("Invalid configuration template: {}", .0.join("; "))]
    ConfigTemplateInvalid(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
