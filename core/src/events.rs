//! Lifecycle events
//!
//! Every event is logged through `tracing`, handed to synchronous listeners
//! and published on a tokio broadcast channel for async subscribers.

use crate::alerts::{Alert, Severity};
use crate::circuit::CircuitState;
use crate::classifier::FaultKind;
use crate::errors::StopReason;
use crate::health::HealthStatus;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StateChange {
        target: String,
        from: CircuitState,
        to: CircuitState,
    },
    Retry {
        target: String,
        request_id: String,
        /// The attempt about to run (2 for the first retry)
        attempt: u32,
        delay_ms: u64,
        kind: FaultKind,
    },
    RetrySuccess {
        target: String,
        request_id: String,
        attempts: u32,
    },
    RetryFailed {
        target: String,
        request_id: String,
        attempts: u32,
        kind: FaultKind,
        reason: StopReason,
    },
    StatusChange {
        target: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    Alert(Alert),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::StateChange { .. } => "state_change",
            Event::Retry { .. } => "retry",
            Event::RetrySuccess { .. } => "retry_success",
            Event::RetryFailed { .. } => "retry_failed",
            Event::StatusChange { .. } => "status_change",
            Event::Alert(_) => "alert",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Event::StateChange { target, .. }
            | Event::Retry { target, .. }
            | Event::RetrySuccess { target, .. }
            | Event::RetryFailed { target, .. }
            | Event::StatusChange { target, .. } => target,
            Event::Alert(alert) => &alert.target,
        }
    }

    fn log(&self) {
        match self {
            Event::StateChange { target, from, to } => {
                tracing::info!(target_name = %target, %from, %to, "circuit state change");
            }
            Event::Retry {
                target,
                request_id,
                attempt,
                delay_ms,
                kind,
            } => {
                tracing::debug!(
                    target_name = %target,
                    %request_id,
                    attempt,
                    delay_ms,
                    %kind,
                    "retrying"
                );
            }
            Event::RetrySuccess {
                target,
                request_id,
                attempts,
            } => {
                tracing::debug!(
                    target_name = %target,
                    %request_id,
                    attempts,
                    "succeeded after retry"
                );
            }
            Event::RetryFailed {
                target,
                request_id,
                attempts,
                kind,
                reason,
            } => {
                tracing::warn!(
                    target_name = %target,
                    %request_id,
                    attempts,
                    %kind,
                    %reason,
                    "request failed"
                );
            }
            Event::StatusChange { target, from, to } => {
                tracing::info!(target_name = %target, %from, %to, "health status change");
            }
            Event::Alert(alert) => {
                let (target, id, message) = (&alert.target, alert.id, &alert.message);
                match alert.severity {
                    Severity::Info => {
                        tracing::info!(target_name = %target, alert_id = %id, "{message}")
                    }
                    Severity::Warning => {
                        tracing::warn!(target_name = %target, alert_id = %id, "{message}")
                    }
                    Severity::Critical => {
                        tracing::error!(target_name = %target, alert_id = %id, "{message}")
                    }
                }
            }
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fan-out point for events
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<Event>,
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Register a synchronous listener, invoked on the emitting task
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn emit(&self, event: Event) {
        event.log();

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener(&event);
        }

        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.sender.receiver_count())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_subscribers_and_listeners_receive_events() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe();

        let names = Arc::new(Mutex::new(Vec::new()));
        let names_clone = names.clone();
        hub.on_event(move |event| names_clone.lock().push(event.name()));

        hub.emit(Event::StateChange {
            target: "search".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });

        let received = rx.recv().await.expect("event delivered");
        assert_eq!(received.name(), "state_change");
        assert_eq!(received.target(), "search");
        assert_eq!(*names.lock(), vec!["state_change"]);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let hub = EventHub::default();
        hub.emit(Event::RetrySuccess {
            target: "search".into(),
            request_id: "r1".into(),
            attempts: 2,
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::Retry {
            target: "search".into(),
            request_id: "r1".into(),
            attempt: 2,
            delay_ms: 200,
            kind: FaultKind::Network,
        };

        let json = serde_json::to_value(&event).expect("serializable");
        assert_eq!(json["type"], "retry");
        assert_eq!(json["delay_ms"], 200);
        assert_eq!(json["kind"], "network");
    }
}
