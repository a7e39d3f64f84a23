//! Three-tier instance manager.
//!
//! One tier per lifecycle mode. Each tier keys instances by
//! [`InstanceKey`]; creation and stop for a key serialize on a per-key
//! lock so concurrent get-or-create calls converge on one instance and a
//! stop waits out an in-flight spawn instead of racing it.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::{process::Command, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    instance::{
        Instance, InstanceHandle, InstanceKey, InstanceStatus, LifecycleMode, RequestContext,
    },
    limits::{check_mode_allowed, check_resource_request, LimitsRegistry},
    template,
};
use crate::{
    config::{BackendConfig, TransportConfig, UserLimits},
    error::{BridgeError, BridgeResult},
    events::{BridgeEvent, EventBus},
    monitor::ResourceMonitor,
};

/// Ceiling on spawn plus startup confirmation.
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Settle window after spawn in which an immediate exit counts as failure.
const SPAWN_SETTLE: Duration = Duration::from_millis(100);
/// Time a process gets to exit after the graceful signal.
const GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Total stop budget; the remainder after the grace period bounds the
/// forced kill.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

const GLOBAL_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const SCOPED_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct TierManager {
    mode: LifecycleMode,
    idle_timeout: Duration,
    instances: DashMap<InstanceKey, Arc<InstanceHandle>>,
    creation_locks: DashMap<InstanceKey, Arc<Mutex<()>>>,
    /// Quota counting plus provisional insert is a cross-entry section;
    /// the per-key locks cannot order it.
    admission: parking_lot::Mutex<()>,
}

impl TierManager {
    fn new(mode: LifecycleMode, idle_timeout: Duration) -> Self {
        Self {
            mode,
            idle_timeout,
            instances: DashMap::new(),
            creation_locks: DashMap::new(),
            admission: parking_lot::Mutex::new(()),
        }
    }

    fn lock_for(&self, key: &InstanceKey) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry only when nobody else holds a clone. A waiter
    /// queued on the lock keeps the entry, so every caller for this key
    /// keeps serializing on the same mutex. The caller's own clone plus
    /// the map's make two; the predicate runs under the shard lock, so
    /// no new clone can slip in between the count and the removal.
    fn release_lock(&self, key: &InstanceKey) {
        self.creation_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

pub struct InstanceManager {
    global: TierManager,
    user: TierManager,
    session: TierManager,
    limits: LimitsRegistry,
    monitor: Arc<ResourceMonitor>,
    events: Arc<EventBus>,
    cleanup_token: CancellationToken,
    cleanup_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl InstanceManager {
    pub fn new(
        limits: HashMap<String, UserLimits>,
        monitor: Arc<ResourceMonitor>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            global: TierManager::new(LifecycleMode::Global, GLOBAL_IDLE_TIMEOUT),
            user: TierManager::new(LifecycleMode::User, SCOPED_IDLE_TIMEOUT),
            session: TierManager::new(LifecycleMode::Session, SCOPED_IDLE_TIMEOUT),
            limits: LimitsRegistry::new(limits),
            monitor,
            events,
            cleanup_token: CancellationToken::new(),
            cleanup_task: parking_lot::Mutex::new(None),
        }
    }

    fn tier(&self, mode: LifecycleMode) -> &TierManager {
        match mode {
            LifecycleMode::Global => &self.global,
            LifecycleMode::User => &self.user,
            LifecycleMode::Session => &self.session,
        }
    }

    fn tiers(&self) -> [&TierManager; 3] {
        [&self.global, &self.user, &self.session]
    }

    pub fn set_user_limits(&self, user_id: &str, limits: UserLimits) {
        self.limits.set_user_limits(user_id, limits);
    }

    pub fn replace_limits(&self, limits: HashMap<String, UserLimits>) {
        self.limits.replace(limits);
    }

    /// Get the instance for this backend and context, spawning it if absent.
    ///
    /// Idempotent per key: concurrent callers serialize on the key's
    /// creation lock and all but the first reuse the spawned instance.
    pub async fn get_or_create(
        &self,
        config: &BackendConfig,
        context: &RequestContext,
    ) -> BridgeResult<Instance> {
        if !matches!(config.transport, TransportConfig::Stdio { .. }) {
            return Err(BridgeError::Config(format!(
                "backend '{}': lifecycle instances require a stdio transport",
                config.id
            )));
        }

        let user_label = context.user_id.as_deref().unwrap_or("anonymous");
        let user_limits = self.limits.for_user(user_label);
        if context.user_id.is_some() {
            check_mode_allowed(&user_limits, user_label, context.mode)?;
        }
        check_resource_request(&user_limits, user_label, config.resources.as_ref())?;

        let key = InstanceKey::for_context(&config.id, context)?;
        let tier = self.tier(context.mode);
        let lock = tier.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(handle) = tier.instances.get(&key).map(|e| Arc::clone(e.value())) {
            match handle.status() {
                InstanceStatus::Running | InstanceStatus::Starting => {
                    if self.confirm_alive(&handle).await? {
                        handle.touch();
                        debug!("Reusing instance '{}' for '{}'", handle.id, config.id);
                        return Ok(handle.snapshot());
                    }
                    // Exited behind our back; replace it.
                    self.discard(tier, &key, &handle, "process exited unexpectedly");
                }
                _ => {
                    tier.instances.remove(&key);
                }
            }
        }

        let resolved = match template::resolve_backend(config, context) {
            Ok(resolved) => resolved,
            Err(e) => {
                tier.release_lock(&key);
                return Err(e);
            }
        };
        let handle = Arc::new(InstanceHandle::new(key.clone(), resolved));
        {
            let admission = tier.admission.lock();
            if let Err(e) = self.check_instance_quota(tier, &key, &user_limits) {
                drop(admission);
                tier.release_lock(&key);
                return Err(e);
            }
            tier.instances.insert(key.clone(), Arc::clone(&handle));
        }

        match spawn_process(&handle).await {
            Ok(pid) => {
                {
                    let mut state = handle.state.lock();
                    state.status = InstanceStatus::Running;
                    state.pid = Some(pid);
                }
                self.monitor.register(&handle.id, pid);
                info!(
                    "Started {} instance '{}' for backend '{}' (pid {})",
                    context.mode, handle.id, config.id, pid
                );
                self.events.emit(BridgeEvent::InstanceCreated {
                    instance_id: handle.id.clone(),
                    backend_id: config.id.clone(),
                    mode: context.mode,
                });
                Ok(handle.snapshot())
            }
            Err(e) => {
                tier.instances.remove(&key);
                tier.release_lock(&key);
                self.events.emit(BridgeEvent::InstanceError {
                    instance_id: handle.id.clone(),
                    backend_id: config.id.clone(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stop the instance this context maps to. Stopping a key with no
    /// instance is a logged no-op.
    pub async fn stop(&self, backend_id: &str, context: &RequestContext) -> BridgeResult<()> {
        let key = InstanceKey::for_context(backend_id, context)?;
        self.stop_key(context.mode, &key).await
    }

    /// Stop an instance by its id, whatever tier it lives in.
    pub async fn stop_by_id(&self, instance_id: &str) -> BridgeResult<()> {
        for tier in self.tiers() {
            let found = tier
                .instances
                .iter()
                .find(|e| e.value().id == instance_id)
                .map(|e| e.key().clone());
            if let Some(key) = found {
                return self.stop_key(tier.mode, &key).await;
            }
        }
        warn!("Stop requested for unknown instance '{}'", instance_id);
        Ok(())
    }

    async fn stop_key(&self, mode: LifecycleMode, key: &InstanceKey) -> BridgeResult<()> {
        let tier = self.tier(mode);
        let lock = tier.lock_for(key);
        let _guard = lock.lock().await;

        let Some(handle) = tier.instances.get(key).map(|e| Arc::clone(e.value())) else {
            tier.release_lock(key);
            debug!("No instance to stop for backend '{}'", key.backend_id);
            return Ok(());
        };

        handle.set_status(InstanceStatus::Stopping);
        let result = terminate_process(&handle).await;

        // The slot frees up even when termination reported an error; the
        // process state is unknown at that point and keeping the entry
        // would wedge the key forever.
        tier.instances.remove(key);
        tier.release_lock(key);
        self.monitor.unregister(&handle.id);

        match result {
            Ok(()) => {
                handle.set_status(InstanceStatus::Stopped);
                info!("Stopped instance '{}'", handle.id);
                self.events.emit(BridgeEvent::InstanceStopped {
                    instance_id: handle.id.clone(),
                    backend_id: key.backend_id.clone(),
                    mode,
                });
                Ok(())
            }
            Err(e) => {
                handle.record_error();
                handle.set_status(InstanceStatus::Error);
                self.events.emit(BridgeEvent::InstanceError {
                    instance_id: handle.id.clone(),
                    backend_id: key.backend_id.clone(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stop every instance belonging to a user, across the user and
    /// session tiers. Returns the number stopped.
    pub async fn terminate_user_instances(&self, user_id: &str) -> usize {
        let mut targets = Vec::new();
        for tier in [&self.user, &self.session] {
            for entry in tier.instances.iter() {
                if entry.key().user_id.as_deref() == Some(user_id) {
                    targets.push((tier.mode, entry.key().clone()));
                }
            }
        }
        self.stop_all(targets).await
    }

    /// Stop every instance belonging to a session. Returns the number
    /// stopped.
    pub async fn terminate_session_instances(&self, session_id: &str) -> usize {
        let targets: Vec<(LifecycleMode, InstanceKey)> = self
            .session
            .instances
            .iter()
            .filter(|e| e.key().session_id.as_deref() == Some(session_id))
            .map(|e| (LifecycleMode::Session, e.key().clone()))
            .collect();
        self.stop_all(targets).await
    }

    async fn stop_all(&self, targets: Vec<(LifecycleMode, InstanceKey)>) -> usize {
        let stops = targets
            .into_iter()
            .map(|(mode, key)| async move { self.stop_key(mode, &key).await });
        join_all(stops)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count()
    }

    pub fn list_instances(&self) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .tiers()
            .iter()
            .flat_map(|tier| tier.instances.iter().map(|e| e.value().snapshot()))
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        instances
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<Instance> {
        self.tiers().iter().find_map(|tier| {
            tier.instances
                .iter()
                .find(|e| e.value().id == instance_id)
                .map(|e| e.value().snapshot())
        })
    }

    /// Start the periodic idle-eviction and crash-detection task.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let token = self.cleanup_token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.cleanup_pass().await,
                }
            }
        });
        *self.cleanup_task.lock() = Some(task);
    }

    /// One eviction sweep: drop crashed instances, stop instances idle past
    /// their tier's timeout.
    pub async fn cleanup_pass(&self) {
        for tier in self.tiers() {
            let entries: Vec<(InstanceKey, Arc<InstanceHandle>)> = tier
                .instances
                .iter()
                .map(|e| (e.key().clone(), Arc::clone(e.value())))
                .collect();

            for (key, handle) in entries {
                if handle.status() != InstanceStatus::Running {
                    continue;
                }

                let alive = self.confirm_alive(&handle).await.unwrap_or(false);
                if !alive {
                    self.discard(tier, &key, &handle, "process exited unexpectedly");
                    continue;
                }

                let user_label = key.user_id.as_deref().unwrap_or("anonymous");
                let idle_timeout = self
                    .limits
                    .for_user(user_label)
                    .idle_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(tier.idle_timeout);
                let idle_limit = chrono::Duration::from_std(idle_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
                if handle.idle_duration() > idle_limit {
                    info!(
                        "Evicting idle {} instance '{}'",
                        tier.mode, handle.id
                    );
                    if let Err(e) = self.stop_key(tier.mode, &key).await {
                        warn!("Idle eviction of '{}' failed: {}", handle.id, e);
                    }
                }
            }
        }
    }

    /// Stop the cleanup task and every instance.
    pub async fn shutdown(&self) {
        self.cleanup_token.cancel();
        let task = self.cleanup_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let targets: Vec<(LifecycleMode, InstanceKey)> = self
            .tiers()
            .iter()
            .flat_map(|tier| {
                tier.instances
                    .iter()
                    .map(|e| (tier.mode, e.key().clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        let stopped = self.stop_all(targets).await;
        info!("Instance manager shut down, {} instances stopped", stopped);
    }

    async fn confirm_alive(&self, handle: &InstanceHandle) -> BridgeResult<bool> {
        let mut process = handle.process.lock().await;
        match process.as_mut() {
            Some(child) => Ok(child.try_wait()?.is_none()),
            None => Ok(false),
        }
    }

    fn discard(
        &self,
        tier: &TierManager,
        key: &InstanceKey,
        handle: &InstanceHandle,
        reason: &str,
    ) {
        handle.record_error();
        handle.set_status(InstanceStatus::Crashed);
        tier.instances.remove(key);
        self.monitor.unregister(&handle.id);
        warn!("Instance '{}' discarded: {}", handle.id, reason);
        self.events.emit(BridgeEvent::InstanceError {
            instance_id: handle.id.clone(),
            backend_id: key.backend_id.clone(),
            message: reason.to_string(),
        });
    }

    fn check_instance_quota(
        &self,
        tier: &TierManager,
        key: &InstanceKey,
        limits: &UserLimits,
    ) -> BridgeResult<()> {
        let (scope_count, max, user) = match tier.mode {
            LifecycleMode::Global => return Ok(()),
            LifecycleMode::User => {
                let user = key.user_id.clone().unwrap_or_default();
                let count = tier
                    .instances
                    .iter()
                    .filter(|e| e.key().user_id == key.user_id)
                    .count();
                (count, limits.max_user_instances, user)
            }
            LifecycleMode::Session => {
                let user = key.user_id.clone().unwrap_or_default();
                let count = tier
                    .instances
                    .iter()
                    .filter(|e| e.key().session_id == key.session_id)
                    .count();
                (count, limits.max_session_instances, user)
            }
        };

        if scope_count >= max {
            return Err(BridgeError::InstanceLimitExceeded {
                user,
                current: scope_count,
                max,
            });
        }
        Ok(())
    }
}

/// Spawn the instance process and confirm it survives the settle window.
async fn spawn_process(handle: &InstanceHandle) -> BridgeResult<u32> {
    let TransportConfig::Stdio {
        command,
        args,
        env,
        cwd,
    } = &handle.config.transport
    else {
        return Err(BridgeError::Config(
            "instance spawn requires a stdio transport".to_string(),
        ));
    };

    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.env("MCP_BRIDGE_INSTANCE_ID", &handle.id);
    if let Some(user) = &handle.key.user_id {
        cmd.env("MCP_BRIDGE_USER_ID", user);
    }
    if let Some(session) = &handle.key.session_id {
        cmd.env("MCP_BRIDGE_SESSION_ID", session);
    }

    let confirm = async {
        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::ProcessSpawn(format!("spawn '{}': {}", command, e)))?;
        tokio::time::sleep(SPAWN_SETTLE).await;
        if let Some(status) = child.try_wait()? {
            return Err(BridgeError::ProcessSpawn(format!(
                "'{}' exited during startup with {}",
                command, status
            )));
        }
        Ok(child)
    };

    let child = tokio::time::timeout(SPAWN_TIMEOUT, confirm)
        .await
        .map_err(|_| BridgeError::ProcessSpawnTimeout(SPAWN_TIMEOUT.as_secs()))??;

    let pid = child
        .id()
        .ok_or_else(|| BridgeError::ProcessSpawn(format!("'{}' has no pid", command)))?;
    *handle.process.lock().await = Some(child);
    Ok(pid)
}

/// Graceful-then-forced termination within the stop budget.
async fn terminate_process(handle: &InstanceHandle) -> BridgeResult<()> {
    let mut guard = handle.process.lock().await;
    let Some(child) = guard.as_mut() else {
        return Ok(());
    };

    if child.try_wait()?.is_some() {
        *guard = None;
        return Ok(());
    }

    signal_graceful(child)?;

    match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
        Ok(status) => {
            status?;
            *guard = None;
            return Ok(());
        }
        Err(_) => {
            debug!("Instance '{}' ignored graceful stop, killing", handle.id);
        }
    }

    child.start_kill()?;
    match tokio::time::timeout(SHUTDOWN_WAIT - GRACE_PERIOD, child.wait()).await {
        Ok(status) => {
            status?;
            *guard = None;
            Ok(())
        }
        Err(_) => Err(BridgeError::ProcessStop(format!(
            "instance '{}' did not exit after forced kill",
            handle.id
        ))),
    }
}

#[cfg(unix)]
fn signal_graceful(child: &tokio::process::Child) -> BridgeResult<()> {
    use nix::{sys::signal, unistd::Pid};

    match child.id() {
        Some(pid) => {
            signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGTERM)
                .map_err(|e| BridgeError::ProcessStop(format!("signal pid {}: {}", pid, e)))
        }
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn signal_graceful(child: &mut tokio::process::Child) -> BridgeResult<()> {
    child.start_kill()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_backend(id: &str, command: &str, args: Vec<&str>) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: args.into_iter().map(String::from).collect(),
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

    fn sleeper(id: &str) -> BackendConfig {
        stdio_backend(id, "sleep", vec!["30"])
    }

    fn manager_with(limits: HashMap<String, UserLimits>) -> InstanceManager {
        let events = Arc::new(EventBus::new());
        let monitor = Arc::new(ResourceMonitor::new(Arc::clone(&events)));
        InstanceManager::new(limits, monitor, events)
    }

    fn manager() -> InstanceManager {
        manager_with(HashMap::new())
    }

    #[tokio::test]
    async fn rejects_non_stdio_backends() {
        let manager = manager();
        let config = BackendConfig {
            id: "web".to_string(),
            transport: TransportConfig::Sse {
                url: "https://example.com/sse".to_string(),
                headers: HashMap::new(),
            },
            enabled: true,
            timeout_secs: 30,
            max_retries: 5,
            retry_backoff_ms: 500,
            resources: None,
        };
        match manager.get_or_create(&config, &RequestContext::global()).await {
            Err(BridgeError::Config(msg)) => assert!(msg.contains("stdio")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn creates_and_reuses_per_key() {
        let manager = manager();
        let config = sleeper("fs");
        let context = RequestContext::for_user("alice");

        let first = manager.get_or_create(&config, &context).await.unwrap();
        assert_eq!(first.status, InstanceStatus::Running);
        assert!(first.pid.is_some());

        let second = manager.get_or_create(&config, &context).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.request_count, first.request_count + 1);
        assert_eq!(manager.list_instances().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_creates_converge_on_one_instance() {
        let manager = manager();
        let config = sleeper("fs");
        let context = RequestContext::for_user("alice");

        let (a, b) = tokio::join!(
            manager.get_or_create(&config, &context),
            manager.get_or_create(&config, &context),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.pid, b.pid);
        assert_eq!(manager.list_instances().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn create_queued_behind_a_slow_stop_still_serializes() {
        // The stop victim ignores SIGTERM, so stop_key holds the key's
        // lock through the grace period. Creators queued behind it must
        // keep serializing on that same lock afterwards and converge on
        // a single replacement instance.
        let manager = Arc::new(manager());
        let stubborn = stdio_backend("fs", "sh", vec!["-c", "trap '' TERM; sleep 30"]);
        let context = RequestContext::for_user("alice");

        manager.get_or_create(&stubborn, &context).await.unwrap();

        let stopper = {
            let manager = Arc::clone(&manager);
            let context = context.clone();
            tokio::spawn(async move { manager.stop("fs", &context).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let creator_b = {
            let manager = Arc::clone(&manager);
            let context = context.clone();
            tokio::spawn(async move { manager.get_or_create(&sleeper("fs"), &context).await })
        };
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let creator_c = {
            let manager = Arc::clone(&manager);
            let context = context.clone();
            tokio::spawn(async move { manager.get_or_create(&sleeper("fs"), &context).await })
        };

        stopper.await.unwrap().unwrap();
        let b = creator_b.await.unwrap().unwrap();
        let c = creator_c.await.unwrap().unwrap();
        assert_eq!(b.id, c.id);
        assert_eq!(manager.list_instances().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_creates_for_distinct_keys_share_one_quota_slot() {
        let mut limits = HashMap::new();
        limits.insert(
            "alice".to_string(),
            UserLimits {
                max_user_instances: 1,
                ..UserLimits::default()
            },
        );
        let manager = manager_with(limits);
        let context = RequestContext::for_user("alice");

        // Different backends, so different keys: the per-key locks do not
        // order these two. Admission must still admit exactly one.
        let fs_config = sleeper("fs");
        let git_config = sleeper("git");
        let (a, b) = tokio::join!(
            manager.get_or_create(&fs_config, &context),
            manager.get_or_create(&git_config, &context),
        );
        let outcomes = [a, b];
        let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(BridgeError::InstanceLimitExceeded { current: 1, max: 1, .. })
        )));
        assert_eq!(manager.list_instances().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn distinct_users_get_distinct_instances() {
        let manager = manager();
        let config = sleeper("fs");

        let alice = manager
            .get_or_create(&config, &RequestContext::for_user("alice"))
            .await
            .unwrap();
        let bob = manager
            .get_or_create(&config, &RequestContext::for_user("bob"))
            .await
            .unwrap();
        assert_ne!(alice.id, bob.id);
        assert_eq!(manager.list_instances().len(), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn user_quota_is_enforced() {
        let mut limits = HashMap::new();
        limits.insert(
            "alice".to_string(),
            UserLimits {
                max_user_instances: 1,
                ..UserLimits::default()
            },
        );
        let manager = manager_with(limits);
        let context = RequestContext::for_user("alice");

        manager
            .get_or_create(&sleeper("fs"), &context)
            .await
            .unwrap();
        match manager.get_or_create(&sleeper("git"), &context).await {
            Err(BridgeError::InstanceLimitExceeded { user, current, max }) => {
                assert_eq!(user, "alice");
                assert_eq!(current, 1);
                assert_eq!(max, 1);
            }
            other => panic!("expected InstanceLimitExceeded, got {:?}", other),
        }

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn quota_reuse_does_not_count_twice() {
        let mut limits = HashMap::new();
        limits.insert(
            "alice".to_string(),
            UserLimits {
                max_user_instances: 1,
                ..UserLimits::default()
            },
        );
        let manager = manager_with(limits);
        let context = RequestContext::for_user("alice");

        let first = manager
            .get_or_create(&sleeper("fs"), &context)
            .await
            .unwrap();
        let again = manager
            .get_or_create(&sleeper("fs"), &context)
            .await
            .unwrap();
        assert_eq!(first.id, again.id);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn forbidden_mode_is_rejected() {
        let mut limits = HashMap::new();
        limits.insert(
            "alice".to_string(),
            UserLimits {
                allowed_modes: vec![LifecycleMode::Session],
                ..UserLimits::default()
            },
        );
        let manager = manager_with(limits);

        match manager
            .get_or_create(&sleeper("fs"), &RequestContext::for_user("alice"))
            .await
        {
            Err(BridgeError::LifecycleModeForbidden { mode, .. }) => assert_eq!(mode, "user"),
            other => panic!("expected LifecycleModeForbidden, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_instance() {
        let manager = manager();
        let config = stdio_backend("bad", "/nonexistent/mcp-server", vec![]);

        match manager
            .get_or_create(&config, &RequestContext::global())
            .await
        {
            Err(BridgeError::ProcessSpawn(_)) => {}
            other => panic!("expected ProcessSpawn, got {:?}", other),
        }
        assert!(manager.list_instances().is_empty());
    }

    #[tokio::test]
    async fn immediate_exit_counts_as_spawn_failure() {
        let manager = manager();
        let config = stdio_backend("flaky", "false", vec![]);

        match manager
            .get_or_create(&config, &RequestContext::global())
            .await
        {
            Err(BridgeError::ProcessSpawn(msg)) => assert!(msg.contains("exited")),
            other => panic!("expected ProcessSpawn, got {:?}", other),
        }
        assert!(manager.list_instances().is_empty());
    }

    #[tokio::test]
    async fn template_errors_propagate() {
        let manager = manager();
        let config = stdio_backend("fs", "sleep", vec!["${bogus}"]);

        match manager
            .get_or_create(&config, &RequestContext::global())
            .await
        {
            Err(BridgeError::ConfigTemplateInvalid(errors)) => {
                assert!(errors[0].contains("${bogus}"))
            }
            other => panic!("expected template error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_removes_instance_and_frees_slot() {
        let manager = manager();
        let config = sleeper("fs");
        let context = RequestContext::for_user("alice");

        let first = manager.get_or_create(&config, &context).await.unwrap();
        manager.stop("fs", &context).await.unwrap();
        assert!(manager.list_instances().is_empty());
        assert!(manager.get_instance(&first.id).is_none());

        let second = manager.get_or_create(&config, &context).await.unwrap();
        assert_ne!(first.id, second.id);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_without_instance_is_a_no_op() {
        let manager = manager();
        manager
            .stop("fs", &RequestContext::for_user("alice"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_by_id_finds_the_tier() {
        let manager = manager();
        let instance = manager
            .get_or_create(&sleeper("fs"), &RequestContext::for_session("alice", "s1"))
            .await
            .unwrap();

        manager.stop_by_id(&instance.id).await.unwrap();
        assert!(manager.list_instances().is_empty());
    }

    #[tokio::test]
    async fn terminate_user_spans_user_and_session_tiers() {
        let manager = manager();
        manager
            .get_or_create(&sleeper("fs"), &RequestContext::for_user("alice"))
            .await
            .unwrap();
        manager
            .get_or_create(&sleeper("fs"), &RequestContext::for_session("alice", "s1"))
            .await
            .unwrap();
        manager
            .get_or_create(&sleeper("fs"), &RequestContext::for_user("bob"))
            .await
            .unwrap();

        let stopped = manager.terminate_user_instances("alice").await;
        assert_eq!(stopped, 2);
        assert_eq!(manager.list_instances().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn terminate_session_leaves_user_tier_alone() {
        let manager = manager();
        manager
            .get_or_create(&sleeper("fs"), &RequestContext::for_user("alice"))
            .await
            .unwrap();
        manager
            .get_or_create(&sleeper("fs"), &RequestContext::for_session("alice", "s1"))
            .await
            .unwrap();

        let stopped = manager.terminate_session_instances("s1").await;
        assert_eq!(stopped, 1);
        assert_eq!(manager.list_instances().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_discards_crashed_instances() {
        let manager = manager();
        let config = stdio_backend("brief", "sleep", vec!["0.3"]);
        let instance = manager
            .get_or_create(&config, &RequestContext::global())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        manager.cleanup_pass().await;
        assert!(manager.get_instance(&instance.id).is_none());
    }

    #[tokio::test]
    async fn cleanup_evicts_idle_running_instances() {
        let mut limits = HashMap::new();
        limits.insert(
            "alice".to_string(),
            UserLimits {
                idle_timeout_secs: Some(0),
                ..UserLimits::default()
            },
        );
        let manager = manager_with(limits);
        let context = RequestContext::for_user("alice");

        let running = manager
            .get_or_create(&sleeper("fs"), &context)
            .await
            .unwrap();

        // A sibling still mid-startup sits in the same tier; the sweep
        // must leave it alone.
        let starting_key = InstanceKey::for_context("git", &context).unwrap();
        let starting = Arc::new(InstanceHandle::new(starting_key.clone(), sleeper("git")));
        manager
            .user
            .instances
            .insert(starting_key, Arc::clone(&starting));

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.cleanup_pass().await;

        assert!(manager.get_instance(&running.id).is_none());
        let survivor = manager.get_instance(&starting.id).unwrap();
        assert_eq!(survivor.status, InstanceStatus::Starting);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_event_is_emitted() {
        let events = Arc::new(EventBus::new());
        let monitor = Arc::new(ResourceMonitor::new(Arc::clone(&events)));
        let manager = InstanceManager::new(HashMap::new(), monitor, Arc::clone(&events));
        let mut rx = events.subscribe();

        let context = RequestContext::for_user("alice");
        manager
            .get_or_create(&sleeper("fs"), &context)
            .await
            .unwrap();
        manager.stop("fs", &context).await.unwrap();

        let mut saw_created = false;
        let mut saw_stopped = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                BridgeEvent::InstanceCreated { .. } => saw_created = true,
                BridgeEvent::InstanceStopped { .. } => saw_stopped = true,
                _ => {}
            }
        }
        assert!(saw_created);
        assert!(saw_stopped);
    }
}
