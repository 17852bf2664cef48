//! Circuit breaker implementation using state machines
//!
//! One breaker governs one target. It moves Closed → Open when failures in
//! the counting window reach the threshold, Open → HalfOpen once the cooldown
//! elapses, and HalfOpen admits exactly one probe whose outcome either closes
//! the circuit or reopens it with an escalated cooldown.

use crate::{Outcome, StorageBackend, callbacks::Callbacks, errors::CircuitError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of failures required to open the circuit (absolute count)
    /// If None, only rate-based threshold is used
    pub failure_threshold: Option<usize>,

    /// Failure rate threshold (0.0-1.0)
    /// If None, only absolute count threshold is used
    pub failure_rate_threshold: Option<f64>,

    /// Minimum number of calls before rate-based threshold is evaluated
    pub minimum_calls: usize,

    /// Time window in seconds for counting failures
    pub failure_window_secs: f64,

    /// Base cooldown in seconds before Open transitions to HalfOpen
    pub cooldown_secs: f64,

    /// Cooldown growth applied each time a probe fails
    pub cooldown_multiplier: f64,

    /// Upper bound for the escalated cooldown
    pub max_cooldown_secs: f64,

    /// Successful probes required in HalfOpen to close the circuit
    pub success_threshold: usize,

    /// Jitter factor for the cooldown (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: cooldown * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Some(5),
            failure_rate_threshold: None,
            minimum_calls: 20,
            failure_window_secs: 60.0,
            cooldown_secs: 30.0,
            cooldown_multiplier: 2.0,
            max_cooldown_secs: 300.0,
            success_threshold: 1,
            jitter_factor: 0.0,
        }
    }
}

impl BreakerConfig {
    /// Semantic checks, one message per problem
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.failure_threshold.is_none() && self.failure_rate_threshold.is_none() {
            problems.push("breaker needs failure_threshold or failure_rate_threshold".to_string());
        }
        if self.failure_threshold == Some(0) {
            problems.push("failure_threshold must be at least 1".to_string());
        }
        if let Some(rate) = self.failure_rate_threshold
            && !(0.0..=1.0).contains(&rate)
        {
            problems.push(format!("failure_rate_threshold {rate} outside 0.0..=1.0"));
        }
        if self.failure_window_secs <= 0.0 {
            problems.push("failure_window_secs must be positive".to_string());
        }
        if self.cooldown_secs < 0.0 {
            problems.push("cooldown_secs must not be negative".to_string());
        }
        if self.cooldown_multiplier < 1.0 {
            problems.push("cooldown_multiplier must be >= 1.0".to_string());
        }
        if self.max_cooldown_secs < self.cooldown_secs {
            problems.push("max_cooldown_secs must be >= cooldown_secs".to_string());
        }
        if self.success_threshold == 0 {
            problems.push("success_threshold must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            problems.push(format!("jitter_factor {} outside 0.0..=1.0", self.jitter_factor));
        }
        problems
    }
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_name(name: &str) -> Self {
        match name {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Point-in-time view of one target's breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerState {
    pub target: String,
    pub state: CircuitState,
    /// Failures inside the counting window
    pub failure_count: usize,
    /// Successes inside the counting window
    pub success_count: usize,
    /// Monotonic seconds at which the circuit last opened
    pub opened_at: Option<f64>,
    pub threshold: Option<usize>,
    /// Current cooldown, including any escalation
    pub cooldown_secs: f64,
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: BreakerConfig,
    pub storage: Arc<dyn StorageBackend>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: BreakerConfig::default(),
            storage: Arc::new(crate::MemoryStorage::new()),
        }
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("storage", &"<dyn StorageBackend>")
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
    /// Cooldown for this opening, jitter already applied
    pub cooldown_secs: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: usize,
    pub probe_in_flight: bool,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [cooldown_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    /// Check if failure threshold is reached (absolute count or rate-based)
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let failures = ctx
            .storage
            .failure_count(&ctx.name, ctx.config.failure_window_secs);

        if let Some(threshold) = ctx.config.failure_threshold
            && failures >= threshold
        {
            return true;
        }

        if let Some(rate_threshold) = ctx.config.failure_rate_threshold {
            let successes = ctx
                .storage
                .success_count(&ctx.name, ctx.config.failure_window_secs);
            let total = failures + successes;

            if total >= ctx.config.minimum_calls && total > 0 {
                let failure_rate = failures as f64 / total as f64;
                if failure_rate >= rate_threshold {
                    return true;
                }
            }
        }

        false
    }
}

impl Circuit<HalfOpen> {
    /// A failed probe always reopens the circuit
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    /// Check if enough probes succeeded to close the circuit
    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .map(|data| data.consecutive_successes >= ctx.config.success_threshold)
            .unwrap_or(false)
    }
}

impl Circuit<Open> {
    /// Check if the cooldown has elapsed for Open -> HalfOpen transition
    fn cooldown_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .map(|data| ctx.storage.monotonic_time() - data.opened_at >= data.cooldown_secs)
            .unwrap_or(true)
    }
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    machine: DynamicCircuit,
    context: CircuitContext,
    callbacks: Callbacks,
    /// Cooldown for the next opening; grows on failed probes
    cooldown_secs: f64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let context = CircuitContext {
            name: name.into(),
            config,
            storage: Arc::new(crate::MemoryStorage::new()),
        };
        Self::with_context_and_callbacks(context, Callbacks::new())
    }

    /// Create a circuit breaker with custom context and callbacks (used by builder)
    pub(crate) fn with_context_and_callbacks(
        context: CircuitContext,
        callbacks: Callbacks,
    ) -> Self {
        let machine = DynamicCircuit::new(context.clone());
        let cooldown_secs = context.config.cooldown_secs;

        Self {
            machine,
            context,
            callbacks,
            cooldown_secs,
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    /// Ask for admission
    ///
    /// Returns `Ok(true)` when the caller was admitted as the HalfOpen probe,
    /// `Ok(false)` for a regular Closed-state admission. Open circuits and a
    /// HalfOpen circuit whose probe is already out reject without queueing.
    pub fn allow(&mut self) -> Result<bool, CircuitError> {
        self.poll_cooldown();

        match self.state() {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let (opened_at, cooldown) = self
                    .machine
                    .open_data()
                    .map(|d| (d.opened_at, d.cooldown_secs))
                    .unwrap_or((0.0, self.cooldown_secs));
                let remaining = (opened_at + cooldown - self.now()).max(0.0);

                Err(CircuitError::Open {
                    circuit: self.context.name.clone(),
                    opened_at,
                    retry_in: Duration::from_secs_f64(remaining),
                })
            }
            CircuitState::HalfOpen => match self.machine.half_open_data_mut() {
                Some(data) if !data.probe_in_flight => {
                    data.probe_in_flight = true;
                    Ok(true)
                }
                _ => Err(CircuitError::ProbeInFlight {
                    circuit: self.context.name.clone(),
                }),
            },
        }
    }

    /// Apply the outcome of an admitted call
    ///
    /// Only the probe's outcome drives HalfOpen transitions; stragglers
    /// admitted before the circuit opened are recorded but cannot close or
    /// reopen it. Cancellation counts as neither success nor failure.
    pub fn record_outcome(&mut self, outcome: Outcome, probe: bool) {
        match outcome {
            Outcome::Success => {
                self.context.storage.record_success(&self.context.name);

                if probe && self.state() == CircuitState::HalfOpen {
                    if let Some(data) = self.machine.half_open_data_mut() {
                        data.probe_in_flight = false;
                        data.consecutive_successes += 1;
                    }
                    if self.machine.handle(CircuitEvent::Close).is_ok() {
                        self.mark_closed();
                    }
                }
            }
            Outcome::Failure => {
                self.context.storage.record_failure(&self.context.name);

                match self.state() {
                    CircuitState::Closed => self.check_and_trip(),
                    CircuitState::HalfOpen if probe => {
                        if self.machine.handle(CircuitEvent::Trip).is_ok() {
                            self.mark_open(CircuitState::HalfOpen);
                        }
                    }
                    _ => {}
                }
            }
            Outcome::Cancelled => {
                if probe {
                    self.release_probe();
                }
            }
        }
    }

    /// Free the HalfOpen probe slot without a verdict
    pub fn release_probe(&mut self) {
        if let Some(data) = self.machine.half_open_data_mut() {
            data.probe_in_flight = false;
        }
    }

    /// Check failure threshold and attempt to trip a closed circuit
    fn check_and_trip(&mut self) {
        if self.state() == CircuitState::Closed
            && self.machine.handle(CircuitEvent::Trip).is_ok()
        {
            self.mark_open(CircuitState::Closed);
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_name(self.machine.current_state())
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn snapshot(&mut self) -> BreakerState {
        self.poll_cooldown();
        let window = self.context.config.failure_window_secs;

        BreakerState {
            target: self.context.name.clone(),
            state: self.state(),
            failure_count: self.context.storage.failure_count(&self.context.name, window),
            success_count: self.context.storage.success_count(&self.context.name, window),
            opened_at: self.machine.open_data().map(|d| d.opened_at),
            threshold: self.context.config.failure_threshold,
            cooldown_secs: self.cooldown_secs,
        }
    }

    /// Clear all records and force the circuit Closed
    pub fn reset(&mut self) {
        let from = self.state();
        self.context.storage.clear(&self.context.name);
        self.machine = DynamicCircuit::new(self.context.clone());
        self.cooldown_secs = self.context.config.cooldown_secs;
        if from != CircuitState::Closed {
            self.callbacks
                .trigger_transition(&self.context.name, from, CircuitState::Closed);
        }
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.context.storage
    }

    fn now(&self) -> f64 {
        self.context.storage.monotonic_time()
    }

    /// Lazily move an Open circuit to HalfOpen once its cooldown elapsed
    fn poll_cooldown(&mut self) {
        if self.state() == CircuitState::Open
            && self.machine.handle(CircuitEvent::AttemptReset).is_ok()
        {
            tracing::info!(target_name = %self.context.name, "circuit half-open, admitting probe");
            self.callbacks.trigger_transition(
                &self.context.name,
                CircuitState::Open,
                CircuitState::HalfOpen,
            );
        }
    }

    /// Apply Open-state bookkeeping (timestamp, cooldown, callbacks)
    fn mark_open(&mut self, from: CircuitState) {
        if from == CircuitState::HalfOpen {
            self.cooldown_secs = (self.cooldown_secs * self.context.config.cooldown_multiplier)
                .min(self.context.config.max_cooldown_secs);
        }
        let cooldown_secs = self.jittered_cooldown();
        let opened_at = self.now();

        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = opened_at;
            data.cooldown_secs = cooldown_secs;
        }

        tracing::warn!(
            target_name = %self.context.name,
            cooldown_secs,
            "circuit opened"
        );
        self.callbacks
            .trigger_transition(&self.context.name, from, CircuitState::Open);
    }

    fn mark_closed(&mut self) {
        self.context.storage.clear(&self.context.name);
        self.cooldown_secs = self.context.config.cooldown_secs;

        tracing::info!(target_name = %self.context.name, "circuit closed");
        self.callbacks.trigger_transition(
            &self.context.name,
            CircuitState::HalfOpen,
            CircuitState::Closed,
        );
    }

    fn jittered_cooldown(&self) -> f64 {
        let jitter = self.context.config.jitter_factor;
        if jitter <= 0.0 || self.cooldown_secs <= 0.0 {
            return self.cooldown_secs;
        }

        let cooldown_ms = (self.cooldown_secs * 1000.0) as u64;
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: cooldown_ms,
            multiplier: 1.0,
            max_delay_ms: cooldown_ms,
        };
        policy.calculate_delay(1, jitter) as f64 / 1000.0
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.machine.current_state())
            .field("cooldown_secs", &self.cooldown_secs)
            .finish()
    }
}

/// Breaker shared between concurrent callers of one target
pub type SharedCircuit = Arc<Mutex<CircuitBreaker>>;

/// Admission ticket for one protected call
///
/// Dropping a permit without recording an outcome (for instance when the
/// caller's future is dropped) releases a held probe slot, so a HalfOpen
/// circuit can never wedge on a probe that will not report back.
#[derive(Debug)]
pub struct CallPermit {
    circuit: SharedCircuit,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    /// Try to get admission from the breaker
    pub fn acquire(circuit: &SharedCircuit) -> Result<Self, CircuitError> {
        let probe = circuit.lock().allow()?;
        Ok(Self {
            circuit: Arc::clone(circuit),
            probe,
            settled: false,
        })
    }

    /// Whether this call is the HalfOpen probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, outcome: Outcome) {
        self.settled = true;
        self.circuit.lock().record_outcome(outcome, self.probe);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.circuit.lock().release_probe();
        }
    }
}
