//! Callback system for circuit breaker state transitions

use crate::circuit::CircuitState;
use std::sync::Arc;

type TransitionFn = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone)]
pub struct Callbacks {
    pub on_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_half_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fired on every transition with (previous, current)
    pub on_state_change: Option<TransitionFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self {
            on_open: None,
            on_close: None,
            on_half_open: None,
            on_state_change: None,
        }
    }

    /// Dispatch a transition to the matching state callback and to the
    /// generic state-change callback
    pub fn trigger_transition(&self, circuit: &str, from: CircuitState, to: CircuitState) {
        let specific = match to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = specific {
            callback(circuit);
        }
        if let Some(callback) = &self.on_state_change {
            callback(circuit, from, to);
        }
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_transition_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let opened = Arc::new(Mutex::new(Vec::new()));

        let mut callbacks = Callbacks::new();
        let opened_clone = opened.clone();
        callbacks.on_open = Some(Arc::new(move |name: &str| {
            opened_clone.lock().push(name.to_string())
        }));
        let seen_clone = seen.clone();
        callbacks.on_state_change = Some(Arc::new(
            move |_name: &str, from: CircuitState, to: CircuitState| {
                seen_clone.lock().push((from, to))
            },
        ));

        callbacks.trigger_transition("search", CircuitState::Closed, CircuitState::Open);
        callbacks.trigger_transition("search", CircuitState::Open, CircuitState::HalfOpen);

        assert_eq!(*opened.lock(), vec!["search".to_string()]);
        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
            ]
        );
    }
}
