//! Bridge configuration types and utilities.
//!
//! Defines backend server configs, transport settings, discovery rules, and
//! per-user limits. Configuration is plain structured data; schema validation
//! and hot reload live outside this crate.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    error::{BridgeError, BridgeResult},
    lifecycle::LifecycleMode,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Backend capability servers to aggregate.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Ordered auto-discovery rules; order is significant.
    #[serde(default)]
    pub discovery_rules: Vec<DiscoveryRule>,

    /// Per-user limits, keyed by user id. A `"default"` entry applies to
    /// unconfigured users.
    #[serde(default)]
    pub limits: HashMap<String, UserLimits>,
}

impl BridgeConfig {
    /// Load configuration from a YAML file.
    pub async fn from_file(path: &str) -> BridgeResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_yaml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("parse {}: {}", path, e)))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend id, used as the namespace prefix for its tools.
    pub id: String,

    #[serde(flatten)]
    pub transport: TransportConfig,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry ceiling after a disconnect before the connection is failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Resource ceiling requested for lifecycle instances of this backend.
    /// Checked against the tenant's quota before spawning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequest>,
}

impl BackendConfig {
    /// Whether a configuration change requires dropping and re-opening the
    /// connection. Only transport identity counts; timeout or retry-policy
    /// changes apply in place.
    pub fn needs_reconnect(&self, other: &Self) -> bool {
        self.transport != other.transport
    }
}

/// Requested resource ceiling for spawned instances.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
}

#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Merged over the parent environment at spawn time.
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    Sse {
        url: String,
        /// Extra request headers (e.g. Authorization, X-API-Key).
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::StreamableHttp { .. } => "streamable-http",
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Stdio { command, args, env, cwd } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &format!("{} vars", env.len()))
                .field("cwd", cwd)
                .finish(),
            TransportConfig::Sse { url, headers } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
            TransportConfig::StreamableHttp { url, headers } => f
                .debug_struct("StreamableHttp")
                .field("url", url)
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

/// One ordered auto-discovery rule.
///
/// Patterns use `*` (any run of characters) and `?` (exactly one character);
/// matching is anchored and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiscoveryRule {
    pub server_pattern: String,
    pub tool_pattern: String,

    /// An exclude rule vetoes the tool even if another rule includes it.
    #[serde(default)]
    pub exclude: bool,
}

/// Per-user instance and resource limits.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UserLimits {
    #[serde(default = "default_max_user_instances")]
    pub max_user_instances: usize,

    #[serde(default = "default_max_session_instances")]
    pub max_session_instances: usize,

    #[serde(default = "default_allowed_modes")]
    pub allowed_modes: Vec<LifecycleMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f32>,

    /// Overrides the tier's idle-eviction timeout for this user's
    /// instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for UserLimits {
    fn default() -> Self {
        Self {
            max_user_instances: default_max_user_instances(),
            max_session_instances: default_max_session_instances(),
            allowed_modes: default_allowed_modes(),
            max_memory_mb: None,
            max_cpu_percent: None,
            idle_timeout_secs: None,
        }
    }
}

// Default value functions
fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_user_instances() -> usize {
    10
}

fn default_max_session_instances() -> usize {
    5
}

fn default_allowed_modes() -> Vec<LifecycleMode> {
    vec![
        LifecycleMode::Global,
        LifecycleMode::User,
        LifecycleMode::Session,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_backend(id: &str, command: &str) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            enabled: true,
            timeout_secs: 30,
            max_retries: 5,
            retry_backoff_ms: 500,
            resources: None,
        }
    }

    #[test]
    fn yaml_minimal_backend() {
        let yaml = r#"
backends:
  - id: "fs"
    protocol: stdio
    command: "mcp-server-fs"
"#;
        let config: BridgeConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].id, "fs");
        assert!(config.backends[0].enabled);
        assert_eq!(config.backends[0].timeout_secs, 30);
        assert_eq!(config.backends[0].max_retries, 5);
        match &config.backends[0].transport {
            TransportConfig::Stdio { command, args, .. } => {
                assert_eq!(command, "mcp-server-fs");
                assert!(args.is_empty());
            }
            other => panic!("expected stdio transport, got {:?}", other),
        }
    }

    #[test]
    fn yaml_full_config() {
        let yaml = r#"
backends:
  - id: "search"
    protocol: sse
    url: "https://search.example.com/sse"
    headers:
      Authorization: "Bearer token"
    max_retries: 3

  - id: "archive"
    protocol: streamable-http
    url: "https://archive.example.com/mcp"
    enabled: false

discovery_rules:
  - server_pattern: "*"
    tool_pattern: "*"
  - server_pattern: "*"
    tool_pattern: "*debug*"
    exclude: true

limits:
  default:
    max_user_instances: 4
  alice:
    max_user_instances: 8
    allowed_modes: [user, session]
    max_memory_mb: 2048
"#;
        let config: BridgeConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].max_retries, 3);
        assert!(!config.backends[1].enabled);

        assert_eq!(config.discovery_rules.len(), 2);
        assert!(!config.discovery_rules[0].exclude);
        assert!(config.discovery_rules[1].exclude);

        let alice = config.limits.get("alice").unwrap();
        assert_eq!(alice.max_user_instances, 8);
        assert_eq!(
            alice.allowed_modes,
            vec![LifecycleMode::User, LifecycleMode::Session]
        );
        assert_eq!(alice.max_memory_mb, Some(2048));
        assert_eq!(config.limits.get("default").unwrap().max_user_instances, 4);
    }

    #[test]
    fn transport_change_requires_reconnect() {
        let a = stdio_backend("fs", "server-a");
        let b = stdio_backend("fs", "server-b");
        assert!(a.needs_reconnect(&b));
    }

    #[test]
    fn timeout_change_does_not_reconnect() {
        let a = stdio_backend("fs", "server-a");
        let mut b = a.clone();
        b.timeout_secs = 120;
        b.max_retries = 1;
        assert!(!a.needs_reconnect(&b));
    }

    #[test]
    fn env_change_requires_reconnect() {
        let a = stdio_backend("fs", "server-a");
        let mut b = a.clone();
        if let TransportConfig::Stdio { env, .. } = &mut b.transport {
            env.insert("MODE".to_string(), "fast".to_string());
        }
        assert!(a.needs_reconnect(&b));
    }

    #[test]
    fn transport_kind_labels() {
        let yaml = r#"
id: "x"
protocol: streamable-http
url: "http://localhost:3000"
"#;
        let config: BackendConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.transport.kind(), "streamable-http");
    }

    #[test]
    fn user_limits_defaults() {
        let limits = UserLimits::default();
        assert_eq!(limits.max_user_instances, 10);
        assert_eq!(limits.max_session_instances, 5);
        assert_eq!(limits.allowed_modes.len(), 3);
        assert!(limits.max_memory_mb.is_none());
    }
}
