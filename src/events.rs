use crate::models::{Message, SessionStatus};
use serde::Serialize;
use tokio::sync::broadcast;

/// Events the broker publishes for server-side streams and observers.
/// Subscribers filter by tenant; publishing never fails.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    SessionConnected {
        tenant_id: String,
        session_id: String,
    },
    SessionDisconnected {
        tenant_id: String,
        session_id: String,
        reason: String,
    },
    SessionReplaced {
        tenant_id: String,
        session_id: String,
    },
    SessionStatusChanged {
        tenant_id: String,
        session_id: String,
        status: SessionStatus,
    },
    MessageDelivered {
        tenant_id: String,
        session_id: String,
        message: Box<Message>,
    },
    MessageQueued {
        tenant_id: String,
        session_id: String,
        message_id: String,
        depth: usize,
    },
    QueueNearCapacity {
        tenant_id: String,
        session_id: String,
        depth: usize,
        capacity: usize,
    },
    MessageDeadLettered {
        tenant_id: String,
        message_id: String,
        reason: String,
    },
    StoreDegraded {
        detail: String,
    },
    StoreRecovered,
}

impl BrokerEvent {
    /// Tenant the event belongs to; None for broker-wide events.
    pub fn tenant(&self) -> Option<&str> {
        match self {
            BrokerEvent::SessionConnected { tenant_id, .. }
            | BrokerEvent::SessionDisconnected { tenant_id, .. }
            | BrokerEvent::SessionReplaced { tenant_id, .. }
            | BrokerEvent::SessionStatusChanged { tenant_id, .. }
            | BrokerEvent::MessageDelivered { tenant_id, .. }
            | BrokerEvent::MessageQueued { tenant_id, .. }
            | BrokerEvent::QueueNearCapacity { tenant_id, .. }
            | BrokerEvent::MessageDeadLettered { tenant_id, .. } => Some(tenant_id),
            BrokerEvent::StoreDegraded { .. } | BrokerEvent::StoreRecovered => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::SessionConnected { .. } => "session_connected",
            BrokerEvent::SessionDisconnected { .. } => "session_disconnected",
            BrokerEvent::SessionReplaced { .. } => "session_replaced",
            BrokerEvent::SessionStatusChanged { .. } => "session_status_changed",
            BrokerEvent::MessageDelivered { .. } => "message_delivered",
            BrokerEvent::MessageQueued { .. } => "message_queued",
            BrokerEvent::QueueNearCapacity { .. } => "queue_near_capacity",
            BrokerEvent::MessageDeadLettered { .. } => "message_dead_lettered",
            BrokerEvent::StoreDegraded { .. } => "store_degraded",
            BrokerEvent::StoreRecovered => "store_recovered",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    pub sender: broadcast::Sender<BrokerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, event: BrokerEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }
}
