//! Resource monitor: periodic CPU and memory sampling of instance
//! processes via the system process table.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{BridgeEvent, EventBus};

/// Default sampling interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub sampled_at: DateTime<Utc>,
}

pub struct ResourceMonitor {
    /// instance id -> pid
    processes: DashMap<String, u32>,
    samples: DashMap<String, ResourceSample>,
    events: Arc<EventBus>,
    poll_interval: Duration,
    system: tokio::sync::Mutex<System>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self::with_interval(events, POLL_INTERVAL)
    }

    pub fn with_interval(events: Arc<EventBus>, poll_interval: Duration) -> Self {
        Self {
            processes: DashMap::new(),
            samples: DashMap::new(),
            events,
            poll_interval,
            system: tokio::sync::Mutex::new(System::new()),
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn register(&self, instance_id: &str, pid: u32) {
        debug!("Monitoring instance '{}' (pid {})", instance_id, pid);
        self.processes.insert(instance_id.to_string(), pid);
    }

    pub fn unregister(&self, instance_id: &str) {
        self.processes.remove(instance_id);
        self.samples.remove(instance_id);
    }

    pub fn latest(&self, instance_id: &str) -> Option<ResourceSample> {
        self.samples.get(instance_id).map(|e| e.value().clone())
    }

    pub fn all_samples(&self) -> Vec<(String, ResourceSample)> {
        self.samples
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Start the periodic sampling task.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let token = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(monitor.poll_interval) => monitor.poll_once().await,
                }
            }
        });
        *self.task.lock() = Some(task);
    }

    /// One sampling pass over every registered process.
    ///
    /// A process missing from the system table is reported once and
    /// dropped from monitoring; lifecycle cleanup owns the instance state.
    pub async fn poll_once(&self) {
        let registered: Vec<(String, u32)> = self
            .processes
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        if registered.is_empty() {
            return;
        }

        let pids: Vec<Pid> = registered
            .iter()
            .map(|(_, pid)| Pid::from_u32(*pid))
            .collect();

        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&pids), true);

        let now = Utc::now();
        for (instance_id, pid) in registered {
            match system.process(Pid::from_u32(pid)) {
                Some(process) => {
                    self.samples.insert(
                        instance_id,
                        ResourceSample {
                            cpu_percent: process.cpu_usage(),
                            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
                            sampled_at: now,
                        },
                    );
                }
                None => {
                    warn!(
                        "Instance '{}' (pid {}) missing from process table",
                        instance_id, pid
                    );
                    self.events.emit(BridgeEvent::MonitorError {
                        instance_id: instance_id.clone(),
                        message: format!("pid {} not found", pid),
                    });
                    self.processes.remove(&instance_id);
                    self.samples.remove(&instance_id);
                }
            }
        }
    }

    /// Stop the sampling task and clear registrations. Any in-flight poll
    /// completes before this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.processes.clear();
        self.samples.clear();
    }
}
