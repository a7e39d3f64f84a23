//! Backend connection management: transport setup, supervision, reconnects.

pub mod backoff;
pub mod connector;
pub mod supervisor;

pub use backoff::RetrySchedule;
pub use connector::{connect, BridgeClient};
pub use supervisor::{
    ConnectionStatus, ConnectionSupervisor, DetailedServerInfo, NamespacedTool, StatusInfo,
    SupervisorStats, ToolConflict,
};
