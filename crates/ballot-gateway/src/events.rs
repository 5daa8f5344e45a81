//! Event bus: broadcast events to all connected WebSocket clients

use std::sync::Arc;

use ballot_core::{HealthTracker, HealthTransition};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::{GatewayEvent, events};

/// Broadcast event bus for the gateway
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<GatewayEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to events (each WebSocket connection gets its own receiver)
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event to all connected clients
    pub fn broadcast(&self, event: GatewayEvent) {
        let receivers = self.sender.receiver_count();
        if receivers > 0 {
            debug!(
                "Broadcasting event '{}' to {} receivers",
                event.event, receivers
            );
            // Ignore send error (no receivers is fine)
            let _ = self.sender.send(event);
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl From<&HealthTransition> for GatewayEvent {
    fn from(transition: &HealthTransition) -> Self {
        GatewayEvent::new(
            events::PROVIDER_HEALTH,
            serde_json::to_value(transition).unwrap_or_default(),
        )
    }
}

/// Relay provider health transitions to every client until the tracker is dropped
pub fn forward_health(health: &HealthTracker, bus: EventBus) -> tokio::task::JoinHandle<()> {
    let mut transitions = health.subscribe();
    tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(transition) => bus.broadcast(GatewayEvent::from(&transition)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Health forwarder lagged by {} transitions", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
