//! Facade over breakers, health, the retry budget and dead letters
//!
//! A call through [`Guard::protect`] is gated by the target's health status
//! and circuit breaker, then driven by the retry manager. Every attempt's
//! outcome feeds the breaker and the health record as it completes.

use crate::alerts::{Alert, AlertLog, Severity};
use crate::budget::{BudgetConfig, BudgetStatus, RetryBudget};
use crate::circuit::{
    BreakerConfig, BreakerState, CallPermit, CircuitBreaker, CircuitState, SharedCircuit,
};
use crate::classifier::{Classifier, DefaultClassifier, Fault};
use crate::config::GuardConfig;
use crate::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterFilter, DeadLetterQueue, DeadLetterStats,
};
use crate::errors::{ProtectError, RetryFailure};
use crate::events::{Event, EventHub};
use crate::health::{HealthConfig, HealthMonitor, HealthRecord, Source};
use crate::policy::RetryPolicy;
use crate::retry::{AttemptObserver, CallContext, RetryManager};
use crate::Outcome;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    #[error("target '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("invalid configuration: {}", .0.join(", "))]
    InvalidConfig(Vec<String>),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error("no dead letter queue configured")]
    NoDeadLetterStore,
    #[error(transparent)]
    Protect(#[from] ProtectError),
}

#[derive(Debug)]
struct TargetEntry {
    policy: RetryPolicy,
    circuit: SharedCircuit,
}

/// Builder for [`Guard`]
pub struct GuardBuilder {
    budget: BudgetConfig,
    classifier: Arc<dyn Classifier>,
    dead_letters: Option<DeadLetterQueue>,
    event_capacity: usize,
    alert_retention: usize,
}

impl GuardBuilder {
    pub fn new() -> Self {
        Self {
            budget: BudgetConfig::default(),
            classifier: Arc::new(DefaultClassifier),
            dead_letters: Some(DeadLetterQueue::in_memory()),
            event_capacity: 1024,
            alert_retention: 500,
        }
    }

    pub fn budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn dead_letters(mut self, queue: DeadLetterQueue) -> Self {
        self.dead_letters = Some(queue);
        self
    }

    pub fn without_dead_letters(mut self) -> Self {
        self.dead_letters = None;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn alert_retention(mut self, retained: usize) -> Self {
        self.alert_retention = retained;
        self
    }

    pub fn build(self) -> Guard {
        let events = EventHub::new(self.event_capacity);
        let budget = Arc::new(RetryBudget::new(self.budget));
        let alerts = Arc::new(AlertLog::new(self.alert_retention));
        let retry = RetryManager::new(
            Arc::clone(&budget),
            self.classifier,
            events.clone(),
            self.dead_letters.clone(),
        );

        Guard {
            targets: Arc::new(DashMap::new()),
            budget,
            retry,
            health: Arc::new(HealthMonitor::new(events.clone(), alerts)),
            dead_letters: self.dead_letters,
            events,
        }
    }
}

impl Default for GuardBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resilience layer for calls to registered upstream targets
///
/// Cloning is cheap; clones share all state.
#[derive(Debug, Clone)]
pub struct Guard {
    targets: Arc<DashMap<String, Arc<TargetEntry>>>,
    budget: Arc<RetryBudget>,
    retry: RetryManager,
    health: Arc<HealthMonitor>,
    dead_letters: Option<DeadLetterQueue>,
    events: EventHub,
}

impl Guard {
    pub fn builder() -> GuardBuilder {
        GuardBuilder::new()
    }

    /// Build a guard and register every configured target
    pub fn from_config(config: &GuardConfig) -> Result<Self, GuardError> {
        config.validate().map_err(GuardError::InvalidConfig)?;

        let mut builder = GuardBuilder::new()
            .budget(config.budget.clone())
            .event_capacity(config.events.capacity)
            .alert_retention(config.alerts.retained);

        builder = match (&config.dead_letter.path, config.dead_letter.is_enabled()) {
            (_, false) => builder.without_dead_letters(),
            (Some(path), true) => builder.dead_letters(DeadLetterQueue::open_file(path)?),
            (None, true) => builder,
        };

        let guard = builder.build();
        for (name, target) in &config.targets {
            guard.register_target(
                name,
                target.retry.clone(),
                target.breaker.clone(),
                target.health.clone(),
            )?;
        }

        tracing::info!(targets = config.targets.len(), "guard configured");
        Ok(guard)
    }

    /// Register a target with its own breaker and health record
    pub fn register_target(
        &self,
        name: &str,
        policy: RetryPolicy,
        breaker: BreakerConfig,
        health: HealthConfig,
    ) -> Result<(), GuardError> {
        let problems: Vec<String> = policy
            .validate()
            .into_iter()
            .chain(breaker.validate())
            .chain(health.validate())
            .collect();
        if !problems.is_empty() {
            return Err(GuardError::InvalidConfig(problems));
        }

        match self.targets.entry(name.to_string()) {
            Entry::Occupied(_) => Err(GuardError::AlreadyRegistered(name.to_string())),
            Entry::Vacant(slot) => {
                let events = self.events.clone();
                let circuit = CircuitBreaker::builder(name)
                    .config(breaker)
                    .on_state_change(move |target, from, to| {
                        events.emit(Event::StateChange {
                            target: target.to_string(),
                            from,
                            to,
                        })
                    })
                    .build();

                self.health.register(name, health);
                slot.insert(Arc::new(TargetEntry {
                    policy,
                    circuit: Arc::new(Mutex::new(circuit)),
                }));
                tracing::info!(target_name = %name, "target registered");
                Ok(())
            }
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<TargetEntry>, GuardError> {
        self.targets
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GuardError::UnknownTarget(name.to_string()))
    }

    /// Run `op` against `target` with breaker, health and retry protection
    ///
    /// Rejections (`CircuitOpen`, `TargetDisabled`) never invoke `op`.
    pub async fn protect<T, E, F, Fut>(
        &self,
        target: &str,
        op: F,
        ctx: &CallContext,
    ) -> Result<T, ProtectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Fault>,
    {
        let entry = self
            .entry(target)
            .map_err(|_| ProtectError::UnknownTarget(target.to_string()))?;

        if self.health.is_disabled(target) {
            tracing::debug!(target_name = %target, "rejected: target disabled");
            return Err(ProtectError::TargetDisabled {
                target: target.to_string(),
            });
        }

        let permit = CallPermit::acquire(&entry.circuit).map_err(|err| {
            tracing::debug!(target_name = %target, error = %err, "rejected by circuit");
            ProtectError::from_circuit(target, err)
        })?;

        let observer = TargetObserver {
            target,
            circuit: &entry.circuit,
            health: &self.health,
            permit: Mutex::new(Some(permit)),
        };

        self.retry
            .execute_with_retry(target, &entry.policy, op, ctx, &observer)
            .await
            .map_err(|err| {
                let err = ProtectError::from_retry(target, err);
                if let ProtectError::Exhausted(failure) = &err {
                    self.alert_exhausted(target, failure);
                }
                err
            })
    }

    fn alert_exhausted(&self, target: &str, failure: &RetryFailure) {
        let stored = match failure.dead_letter_id {
            Some(id) => format!("dead letter {id}"),
            None => "not dead-lettered".to_string(),
        };
        self.health.raise_alert(
            Severity::Warning,
            target,
            format!(
                "{target} request {} exhausted after {} attempts ({}, {}); {stored}",
                failure.fault.request_id, failure.attempts, failure.fault.kind, failure.reason
            ),
        );
    }

    /// Run an out-of-band probe and return the updated health record
    pub async fn check_platform<F, Fut, T, E>(
        &self,
        target: &str,
        probe: F,
    ) -> Result<HealthRecord, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.health
            .check_platform(target, probe)
            .await
            .ok_or_else(|| GuardError::UnknownTarget(target.to_string()))
    }

    /// Shared health monitor, e.g. for `spawn_probe_loop`
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Close the breaker and mark the target healthy
    pub fn reset_target(&self, target: &str) -> Result<(), GuardError> {
        let entry = self.entry(target)?;
        entry.circuit.lock().reset();
        self.health.enable(target);
        tracing::info!(target_name = %target, "target reset by operator");
        Ok(())
    }

    pub fn disable_target(&self, target: &str) -> Result<(), GuardError> {
        if !self.health.disable(target) {
            return Err(GuardError::UnknownTarget(target.to_string()));
        }
        tracing::warn!(target_name = %target, "target disabled by operator");
        Ok(())
    }

    pub fn breaker_status(&self, target: &str) -> Result<BreakerState, GuardError> {
        Ok(self.entry(target)?.circuit.lock().snapshot())
    }

    /// Every breaker, sorted by target
    pub fn breaker_states(&self) -> Vec<BreakerState> {
        let entries: Vec<Arc<TargetEntry>> =
            self.targets.iter().map(|e| Arc::clone(e.value())).collect();
        let mut states: Vec<BreakerState> =
            entries.iter().map(|e| e.circuit.lock().snapshot()).collect();
        states.sort_by(|a, b| a.target.cmp(&b.target));
        states
    }

    pub fn health_summary(&self) -> Vec<HealthRecord> {
        self.health.summary()
    }

    pub fn budget_status(&self) -> BudgetStatus {
        self.budget.status()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.health.alerts().list()
    }

    pub fn acknowledge_alert(&self, id: Uuid) -> bool {
        self.health.alerts().acknowledge(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Register a synchronous listener
    ///
    /// Listeners run on the emitting task, possibly while a breaker lock is
    /// held; they must not call back into the guard.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on_event(listener);
    }

    fn dead_letter_queue(&self) -> Result<&DeadLetterQueue, GuardError> {
        self.dead_letters.as_ref().ok_or(GuardError::NoDeadLetterStore)
    }

    pub fn dead_letter_stats(&self) -> Result<DeadLetterStats, GuardError> {
        Ok(self.dead_letter_queue()?.stats()?)
    }

    pub fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, GuardError> {
        Ok(self.dead_letter_queue()?.list(filter)?)
    }

    pub fn discard_dead_letter(&self, id: Uuid) -> Result<(), GuardError> {
        Ok(self.dead_letter_queue()?.discard(id)?)
    }

    pub fn purge_dead_letter(&self, id: Uuid) -> Result<DeadLetterEntry, GuardError> {
        Ok(self.dead_letter_queue()?.purge(id)?)
    }

    /// Replay a pending dead letter through `protect`
    ///
    /// `handler` receives the stored payload for every attempt. Success marks
    /// the entry reprocessed; exhaustion folds the new failure into the same
    /// entry, which stays pending. A concurrent replay of the same entry is
    /// refused with `DeadLetterError::ReplayInFlight`.
    pub async fn reprocess_dead_letter<T, E, F, Fut>(
        &self,
        id: Uuid,
        mut handler: F,
    ) -> Result<T, GuardError>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Fault>,
    {
        let queue = self.dead_letter_queue()?;
        let claim = queue.begin_replay(id)?;
        let target = claim.entry().target.clone();
        let payload = claim.entry().request.clone();

        let ctx = CallContext::new()
            .with_request_id(claim.entry().request_id.clone())
            .with_payload(payload.clone())
            .replaying(id);

        let value = self
            .protect(&target, move || handler(payload.clone()), &ctx)
            .await?;

        queue.mark_reprocessed(claim)?;
        tracing::info!(dead_letter_id = %id, target_name = %target, "dead letter reprocessed");
        Ok(value)
    }
}

/// Feeds per-attempt outcomes into the target's breaker and health record
struct TargetObserver<'a> {
    target: &'a str,
    circuit: &'a SharedCircuit,
    health: &'a HealthMonitor,
    /// Admission for the first attempt; retries reuse the original gate
    permit: Mutex<Option<CallPermit>>,
}

impl AttemptObserver for TargetObserver<'_> {
    fn on_attempt(&self, _attempt: u32, outcome: Outcome, latency: Duration) {
        match self.permit.lock().take() {
            Some(permit) => permit.record(outcome),
            None => self.circuit.lock().record_outcome(outcome, false),
        }
        self.health.record_outcome(self.target, outcome, latency, Source::Live);
    }

    fn admits_retry(&self) -> bool {
        !self.health.is_disabled(self.target) && self.circuit.lock().state() == CircuitState::Closed
    }
}
