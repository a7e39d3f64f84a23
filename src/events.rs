//! Lifecycle and monitor event fan-out.
//!
//! Subsystems emit events through one broadcast channel; the facade (or
//! tests) subscribe. Emission never blocks and never fails: events sent with
//! no live subscriber are dropped.

use tokio::sync::broadcast;

use crate::lifecycle::LifecycleMode;

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    ServerConnected {
        server_id: String,
    },
    ServerDisconnected {
        server_id: String,
        reason: String,
    },
    InstanceCreated {
        instance_id: String,
        backend_id: String,
        mode: LifecycleMode,
    },
    InstanceStopped {
        instance_id: String,
        backend_id: String,
        mode: LifecycleMode,
    },
    InstanceError {
        instance_id: String,
        backend_id: String,
        message: String,
    },
    MonitorError {
        instance_id: String,
        message: String,
    },
}

pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    const DEFAULT_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: BridgeEvent) {
        // Err just means nobody is listening right now.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
