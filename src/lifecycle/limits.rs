//! Per-user limit lookup and admission checks.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::{
    config::{ResourceRequest, UserLimits},
    error::{BridgeError, BridgeResult},
    lifecycle::LifecycleMode,
};

/// Limits entry applied to users without their own entry.
pub const DEFAULT_LIMITS_KEY: &str = "default";

pub struct LimitsRegistry {
    limits: DashMap<String, UserLimits>,
}

impl LimitsRegistry {
    pub fn new(limits: HashMap<String, UserLimits>) -> Self {
        Self {
            limits: limits.into_iter().collect(),
        }
    }

    /// Effective limits for a user: their own entry, else the `default`
    /// entry, else built-in defaults.
    pub fn for_user(&self, user_id: &str) -> UserLimits {
        self.limits
            .get(user_id)
            .or_else(|| self.limits.get(DEFAULT_LIMITS_KEY))
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Set or overwrite one user's limits entry.
    pub fn set_user_limits(&self, user_id: &str, limits: UserLimits) {
        self.limits.insert(user_id.to_string(), limits);
    }

    /// Replace the whole table, e.g. on configuration reload.
    pub fn replace(&self, limits: HashMap<String, UserLimits>) {
        self.limits.clear();
        for (user, entry) in limits {
            self.limits.insert(user, entry);
        }
    }
}

/// Reject modes the user's limits do not allow.
pub fn check_mode_allowed(
    limits: &UserLimits,
    user_id: &str,
    mode: LifecycleMode,
) -> BridgeResult<()> {
    if limits.allowed_modes.contains(&mode) {
        Ok(())
    } else {
        Err(BridgeError::LifecycleModeForbidden {
            user: user_id.to_string(),
            mode: mode.to_string(),
        })
    }
}

/// Reject resource requests above the user's ceilings.
pub fn check_resource_request(
    limits: &UserLimits,
    user_id: &str,
    request: Option<&ResourceRequest>,
) -> BridgeResult<()> {
    let Some(request) = request else {
        return Ok(());
    };

    if let (Some(requested), Some(max)) = (request.memory_mb, limits.max_memory_mb) {
        if requested > max {
            return Err(BridgeError::ResourceQuotaExceeded {
                user: user_id.to_string(),
                detail: format!("requested {} MB memory, limit {} MB", requested, max),
            });
        }
    }

    if let (Some(requested), Some(max)) = (request.cpu_percent, limits.max_cpu_percent) {
        if requested > max {
            return Err(BridgeError::ResourceQuotaExceeded {
                user: user_id.to_string(),
                detail: format!("requested {}% CPU, limit {}%", requested, max),
            });
        }
    }

    Ok(())
}
