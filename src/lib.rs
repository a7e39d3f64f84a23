//! MCP bridge: aggregates multiple MCP backend servers behind one surface.
//!
//! Four subsystems:
//! - [`core`]: connection supervision over stdio, SSE, and streamable HTTP
//!   transports, with reconnect backoff and configuration reconciliation.
//! - [`registry`]: namespaced tool aggregation, alias maps, wildcard
//!   auto-discovery, and meta-operation dispatch.
//! - [`lifecycle`]: three-tier (global / user / session) process instance
//!   management with quotas, template resolution, and idle eviction.
//! - [`monitor`]: periodic CPU and memory sampling of managed processes.

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod monitor;
pub mod registry;

pub use config::{BackendConfig, BridgeConfig, DiscoveryRule, TransportConfig, UserLimits};
pub use self::core::{
    ConnectionStatus, ConnectionSupervisor, NamespacedTool, StatusInfo, ToolConflict,
};
pub use error::{BridgeError, BridgeResult};
pub use events::{BridgeEvent, EventBus};
pub use lifecycle::{
    Instance, InstanceManager, InstanceStatus, LifecycleMode, RequestContext,
};
pub use monitor::{ResourceMonitor, ResourceSample};
pub use registry::{AliasSource, AliasedTool, ToolRegistry};
