//! Event stream for supervisor observers
//!
//! The supervisor publishes what it does on an in-process event bus backed by
//! `tokio::sync::broadcast`. Subscribers (a status line, a log shipper, tests)
//! only ever receive copies; nothing they do can block or alter the counting
//! loop.
//!
//! If no subscribers exist, events are dropped immediately. A lagging
//! subscriber misses the oldest events instead of slowing the emitter.
//!
//! # Example
//!
//! ```no_run
//! use libautocount::supervisor::events::{EventBus, SupervisorEvent};
//!
//! # async fn example() {
//! let event_bus = EventBus::new(64);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(SupervisorEvent::ValueSent {
//!     identity: "alice".to_string(),
//!     value: 42,
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::Phase;

pub type EventReceiver = broadcast::Receiver<SupervisorEvent>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Publish an event; never blocks and never fails
    pub fn emit(&self, event: SupervisorEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }
}

/// Things the counting supervisor reports as they happen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    PhaseChanged {
        phase: Phase,
    },

    ValueSent {
        identity: String,
        value: u64,
    },

    RateLimited {
        identity: String,
        wait_ms: u64,
        global: bool,
    },

    ResetDetected {
        observed_at: DateTime<Utc>,
        author: String,
    },

    /// Local and observed counts disagree by more than the alert threshold
    Divergence {
        local: u64,
        observed: u64,
    },

    IdentityDisabled {
        identity: String,
        reason: String,
    },

    /// A cycle gave up; the loop carries on from a fresh scan
    CycleFailed {
        operation: String,
        identity: Option<String>,
        cause: String,
    },

    Reconnected {
        identities: usize,
    },

    PersistFailed {
        error: String,
    },

    CountLimitReached {
        limit: u64,
    },

    /// A sent value was not found in the channel afterwards
    SendUnconfirmed {
        identity: String,
        value: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_emission_and_subscription() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.emit(SupervisorEvent::ValueSent {
            identity: "alice".to_string(),
            value: 7,
        });

        match receiver.recv().await.unwrap() {
            SupervisorEvent::ValueSent { identity, value } => {
                assert_eq!(identity, "alice");
                assert_eq!(value, 7);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        event_bus.emit(SupervisorEvent::Reconnected { identities: 3 });

        assert_eq!(
            receiver1.recv().await.unwrap(),
            SupervisorEvent::Reconnected { identities: 3 }
        );
        assert_eq!(
            receiver2.recv().await.unwrap(),
            SupervisorEvent::Reconnected { identities: 3 }
        );
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let event_bus = EventBus::new(10);
        event_bus.emit(SupervisorEvent::PhaseChanged {
            phase: Phase::Scanning,
        });

        // A late subscriber only sees what comes after it
        let mut receiver = event_bus.subscribe();
        event_bus.emit(SupervisorEvent::CountLimitReached { limit: 2 });
        assert_eq!(
            receiver.recv().await.unwrap(),
            SupervisorEvent::CountLimitReached { limit: 2 }
        );
    }

    #[test]
    fn test_event_serialization() {
        let event = SupervisorEvent::CycleFailed {
            operation: "send".to_string(),
            identity: Some("bob".to_string()),
            cause: "Network timeout".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("cycle_failed"));
        assert!(json.contains("Network timeout"));

        let deserialized: SupervisorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&SupervisorEvent::PhaseChanged {
            phase: Phase::Cooldown,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"phase_changed","phase":"cooldown"}"#);
    }
}
