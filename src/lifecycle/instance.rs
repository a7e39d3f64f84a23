//! Instance identity, status, and per-request context.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use uuid::Uuid;

use crate::{
    config::BackendConfig,
    error::{BridgeError, BridgeResult},
};

/// Sharing tier for a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMode {
    /// One instance shared by everyone.
    Global,
    /// One instance per user.
    User,
    /// One instance per session.
    Session,
}

impl fmt::Display for LifecycleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleMode::Global => "global",
            LifecycleMode::User => "user",
            LifecycleMode::Session => "session",
        };
        f.write_str(label)
    }
}

/// Identity of the caller a request runs on behalf of.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub mode: LifecycleMode,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub session_id: Option<String>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl RequestContext {
    fn base(mode: LifecycleMode) -> Self {
        Self {
            mode,
            user_id: None,
            user_email: None,
            session_id: None,
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn global() -> Self {
        Self::base(LifecycleMode::Global)
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::base(LifecycleMode::User)
        }
    }

    pub fn for_session(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            session_id: Some(session_id.into()),
            ..Self::base(LifecycleMode::Session)
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.user_email = Some(email.into());
        self
    }
}

/// Map key identifying one instance slot within a tier.
///
/// Global keys carry no tenant fields; user keys carry the user; session
/// keys carry both user and session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub backend_id: String,
    pub mode: LifecycleMode,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl InstanceKey {
    pub fn for_context(backend_id: &str, context: &RequestContext) -> BridgeResult<Self> {
        let (user_id, session_id) = match context.mode {
            LifecycleMode::Global => (None, None),
            LifecycleMode::User => {
                let user = context.user_id.clone().ok_or_else(|| {
                    BridgeError::InvalidArguments(
                        "user mode requires a user id".to_string(),
                    )
                })?;
                (Some(user), None)
            }
            LifecycleMode::Session => {
                let user = context.user_id.clone().ok_or_else(|| {
                    BridgeError::InvalidArguments(
                        "session mode requires a user id".to_string(),
                    )
                })?;
                let session = context.session_id.clone().ok_or_else(|| {
                    BridgeError::InvalidArguments(
                        "session mode requires a session id".to_string(),
                    )
                })?;
                (Some(user), Some(session))
            }
        };

        Ok(Self {
            backend_id: backend_id.to_string(),
            mode: context.mode,
            user_id,
            session_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Error,
}

/// Point-in-time view of a managed instance.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: String,
    pub backend_id: String,
    pub mode: LifecycleMode,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub request_count: u64,
    pub error_count: u64,
}

pub(crate) struct InstanceState {
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub last_used: DateTime<Utc>,
    pub request_count: u64,
    pub error_count: u64,
}

/// Live record owning the spawned process.
pub(crate) struct InstanceHandle {
    pub id: String,
    pub key: InstanceKey,
    pub config: BackendConfig,
    pub created_at: DateTime<Utc>,
    pub state: Mutex<InstanceState>,
    pub process: tokio::sync::Mutex<Option<Child>>,
}

impl InstanceHandle {
    pub fn new(key: InstanceKey, config: BackendConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            key,
            config,
            created_at: now,
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Starting,
                pid: None,
                last_used: now,
                request_count: 0,
                error_count: 0,
            }),
            process: tokio::sync::Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Instance {
        let state = self.state.lock();
        Instance {
            id: self.id.clone(),
            backend_id: self.key.backend_id.clone(),
            mode: self.key.mode,
            user_id: self.key.user_id.clone(),
            session_id: self.key.session_id.clone(),
            pid: state.pid,
            status: state.status,
            created_at: self.created_at,
            last_used: state.last_used,
            request_count: state.request_count,
            error_count: state.error_count,
        }
    }

    /// Record a use: bumps the request counter and the idle clock.
    pub fn touch(&self) {
        let mut state = self.state.lock();
        state.last_used = Utc::now();
        state.request_count += 1;
    }

    pub fn record_error(&self) {
        self.state.lock().error_count += 1;
    }

    pub fn set_status(&self, status: InstanceStatus) {
        self.state.lock().status = status;
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.lock().status
    }

    pub fn idle_duration(&self) -> chrono::Duration {
        Utc::now() - self.state.lock().last_used
    }
}
