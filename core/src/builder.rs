//! Fluent construction of per-target breakers

use crate::{
    MemoryStorage, StorageBackend,
    callbacks::Callbacks,
    circuit::{BreakerConfig, CircuitBreaker, CircuitContext, CircuitState},
};
use std::sync::Arc;

/// Fluent builder for [`CircuitBreaker`]
pub struct CircuitBuilder {
    name: String,
    config: BreakerConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            storage: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Failures inside the window that trip a Closed circuit
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = Some(threshold);
        self
    }

    /// Trip on failure rate alone
    pub fn disable_failure_threshold(mut self) -> Self {
        self.config.failure_threshold = None;
        self
    }

    /// Failure ratio in `0.0..=1.0` that trips once `minimum_calls` is reached
    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.config.failure_rate_threshold = Some(rate.clamp(0.0, 1.0));
        self
    }

    pub fn minimum_calls(mut self, calls: usize) -> Self {
        self.config.minimum_calls = calls;
        self
    }

    pub fn failure_window_secs(mut self, seconds: f64) -> Self {
        self.config.failure_window_secs = seconds;
        self
    }

    /// Base time spent Open before a probe is admitted
    pub fn cooldown_secs(mut self, seconds: f64) -> Self {
        self.config.cooldown_secs = seconds;
        self
    }

    /// Growth of the cooldown after each failed probe, capped at `max_secs`
    pub fn cooldown_escalation(mut self, multiplier: f64, max_secs: f64) -> Self {
        self.config.cooldown_multiplier = multiplier;
        self.config.max_cooldown_secs = max_secs;
        self
    }

    /// Successful probes needed to close
    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Random spread applied to each cooldown, `0.0..=1.0`
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Called with the target name on every transition into Open
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Called with `(target, from, to)` on every transition
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.callbacks.on_state_change = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> CircuitBreaker {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let context = CircuitContext {
            name: self.name,
            config: self.config,
            storage,
        };

        CircuitBreaker::with_context_and_callbacks(context, self.callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outcome;

    #[test]
    fn test_builder_defaults() {
        let circuit = CircuitBuilder::new("billing").build();

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.name(), "billing");
    }

    #[test]
    fn test_builder_with_callbacks() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let opened = Arc::new(AtomicBool::new(false));
        let opened_clone = opened.clone();

        let mut circuit = CircuitBuilder::new("billing")
            .failure_threshold(2)
            .on_open(move |_name| {
                opened_clone.store(true, Ordering::SeqCst);
            })
            .build();

        for _ in 0..2 {
            let probe = circuit.allow().expect("closed circuit admits");
            circuit.record_outcome(Outcome::Failure, probe);
        }

        assert!(opened.load(Ordering::SeqCst));
        assert!(circuit.is_open());
    }

    #[test]
    fn test_builder_shares_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let mut circuit = CircuitBuilder::new("billing")
            .storage(storage.clone())
            .failure_threshold(10)
            .build();

        let probe = circuit.allow().expect("admitted");
        circuit.record_outcome(Outcome::Failure, probe);

        assert_eq!(storage.failure_count("billing", 60.0), 1);
    }
}
