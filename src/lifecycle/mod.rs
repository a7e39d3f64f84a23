//! Instance lifecycle: tiers, quotas, templates, process management.

pub mod instance;
pub mod limits;
pub mod manager;
pub mod template;

pub use instance::{Instance, InstanceKey, InstanceStatus, LifecycleMode, RequestContext};
pub use limits::{LimitsRegistry, DEFAULT_LIMITS_KEY};
pub use manager::{InstanceManager, SPAWN_TIMEOUT};
pub use template::resolve_backend;
