//! Per-target health tracking
//!
//! Status degrades on consecutive failures (HEALTHY → DEGRADED → UNHEALTHY →
//! DISABLED) and only recovers to HEALTHY after a run of consecutive
//! successes. A DISABLED target rejects all traffic; only out-of-band probes
//! or an operator can bring it back.

use crate::Outcome;
use crate::alerts::{Alert, AlertLog, Severity};
use crate::config::{millis, opt_millis};
use crate::events::{Event, EventHub};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Samples needed before latency percentiles drive alerts
const MIN_LATENCY_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

impl HealthStatus {
    fn alert_severity(self) -> Severity {
        match self {
            HealthStatus::Healthy => Severity::Info,
            HealthStatus::Degraded => Severity::Warning,
            HealthStatus::Unhealthy | HealthStatus::Disabled => Severity::Critical,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Disabled => "disabled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that mark the target DEGRADED
    pub degraded_threshold: u32,
    /// Consecutive failures that mark the target UNHEALTHY
    pub unhealthy_threshold: u32,
    /// Further failed checks while UNHEALTHY before DISABLED
    pub disable_after_checks: u32,
    /// Consecutive successes required to return to HEALTHY
    pub recovery_successes: u32,
    /// Latency samples kept for percentiles
    pub latency_window: usize,
    #[serde(rename = "latency_p95_threshold_ms", with = "opt_millis")]
    pub latency_p95_threshold: Option<Duration>,
    #[serde(rename = "probe_interval_ms", with = "millis")]
    pub probe_interval: Duration,
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 2,
            unhealthy_threshold: 5,
            disable_after_checks: 3,
            recovery_successes: 2,
            latency_window: 100,
            latency_p95_threshold: None,
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.degraded_threshold == 0 {
            problems.push("degraded_threshold must be at least 1".to_string());
        }
        if self.unhealthy_threshold < self.degraded_threshold {
            problems.push("unhealthy_threshold must be >= degraded_threshold".to_string());
        }
        if self.disable_after_checks == 0 {
            problems.push("disable_after_checks must be at least 1".to_string());
        }
        if self.recovery_successes < 2 {
            problems.push("recovery_successes must be at least 2".to_string());
        }
        if self.latency_window == 0 {
            problems.push("latency_window must be positive".to_string());
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            problems.push("probe_interval_ms and probe_timeout_ms must be positive".to_string());
        }
        problems
    }
}

/// Where an outcome came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Caller traffic through `protect`
    Live,
    /// Out-of-band platform check
    Probe,
}

/// Ring buffer of recent latencies
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentile, `quantile` in (0, 1]
    pub fn percentile(&self, quantile: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (quantile.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
        sorted.get(rank.max(1) - 1).copied()
    }
}

/// Point-in-time health view of one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub target: String,
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub unhealthy_checks: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub cancelled: u64,
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(rename = "p95_latency_ms", with = "opt_millis")]
    pub p95_latency: Option<Duration>,
    #[serde(rename = "p99_latency_ms", with = "opt_millis")]
    pub p99_latency: Option<Duration>,
}

/// What changed while applying an outcome; emitted after the lock is dropped
#[derive(Debug, Default)]
struct Effects {
    status_change: Option<(HealthStatus, HealthStatus)>,
    slow_p95: Option<Duration>,
}

#[derive(Debug)]
struct HealthTracker {
    config: HealthConfig,
    status: HealthStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
    unhealthy_checks: u32,
    total_calls: u64,
    total_failures: u64,
    cancelled: u64,
    last_check_at: Option<DateTime<Utc>>,
    latencies: LatencyWindow,
    latency_alerted: bool,
}

impl HealthTracker {
    fn new(config: HealthConfig) -> Self {
        let latencies = LatencyWindow::new(config.latency_window);
        Self {
            config,
            status: HealthStatus::Healthy,
            consecutive_successes: 0,
            consecutive_failures: 0,
            unhealthy_checks: 0,
            total_calls: 0,
            total_failures: 0,
            cancelled: 0,
            last_check_at: None,
            latencies,
            latency_alerted: false,
        }
    }

    fn apply(&mut self, outcome: Outcome, latency: Duration, source: Source) -> Effects {
        let mut effects = Effects::default();
        if source == Source::Probe {
            self.last_check_at = Some(Utc::now());
        }

        // Stragglers finishing after the target was disabled only count toward totals
        let counts_toward_status = self.status != HealthStatus::Disabled || source == Source::Probe;

        match outcome {
            Outcome::Cancelled => {
                self.cancelled += 1;
                return effects;
            }
            Outcome::Success => {
                self.total_calls += 1;
                if counts_toward_status {
                    self.consecutive_successes += 1;
                    self.consecutive_failures = 0;
                    if self.status != HealthStatus::Healthy
                        && self.consecutive_successes >= self.config.recovery_successes
                    {
                        self.unhealthy_checks = 0;
                        effects.status_change = self.set_status(HealthStatus::Healthy);
                    }
                }
            }
            Outcome::Failure => {
                self.total_calls += 1;
                self.total_failures += 1;
                if counts_toward_status {
                    self.consecutive_failures += 1;
                    self.consecutive_successes = 0;
                    effects.status_change = self.degrade();
                }
            }
        }

        self.latencies.push(latency);
        effects.slow_p95 = self.check_latency();
        effects
    }

    fn degrade(&mut self) -> Option<(HealthStatus, HealthStatus)> {
        match self.status {
            HealthStatus::Disabled => None,
            HealthStatus::Unhealthy => {
                self.unhealthy_checks += 1;
                if self.unhealthy_checks >= self.config.disable_after_checks {
                    self.set_status(HealthStatus::Disabled)
                } else {
                    None
                }
            }
            current => {
                let next = if self.consecutive_failures >= self.config.unhealthy_threshold {
                    HealthStatus::Unhealthy
                } else if self.consecutive_failures >= self.config.degraded_threshold {
                    HealthStatus::Degraded
                } else {
                    current
                };
                self.set_status(next)
            }
        }
    }

    /// Returns the P95 once per threshold crossing
    fn check_latency(&mut self) -> Option<Duration> {
        let threshold = self.config.latency_p95_threshold?;
        if self.latencies.len() < MIN_LATENCY_SAMPLES {
            return None;
        }
        let p95 = self.latencies.percentile(0.95)?;
        if p95 > threshold {
            if !self.latency_alerted {
                self.latency_alerted = true;
                return Some(p95);
            }
        } else {
            self.latency_alerted = false;
        }
        None
    }

    fn set_status(&mut self, next: HealthStatus) -> Option<(HealthStatus, HealthStatus)> {
        let previous = self.status;
        if previous == next {
            return None;
        }
        self.status = next;
        Some((previous, next))
    }

    fn force(&mut self, next: HealthStatus) -> Option<(HealthStatus, HealthStatus)> {
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
        self.unhealthy_checks = 0;
        self.set_status(next)
    }

    fn snapshot(&self, target: &str) -> HealthRecord {
        HealthRecord {
            target: target.to_string(),
            status: self.status,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            unhealthy_checks: self.unhealthy_checks,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            cancelled: self.cancelled,
            last_check_at: self.last_check_at,
            p95_latency: self.latencies.percentile(0.95),
            p99_latency: self.latencies.percentile(0.99),
        }
    }
}

/// Health records for every registered target
#[derive(Debug)]
pub struct HealthMonitor {
    targets: DashMap<String, Arc<Mutex<HealthTracker>>>,
    alerts: Arc<AlertLog>,
    events: EventHub,
}

impl HealthMonitor {
    pub fn new(events: EventHub, alerts: Arc<AlertLog>) -> Self {
        Self {
            targets: DashMap::new(),
            alerts,
            events,
        }
    }

    /// Start tracking `target`; returns false if it was already tracked
    pub fn register(&self, target: &str, config: HealthConfig) -> bool {
        match self.targets.entry(target.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(HealthTracker::new(config))));
                true
            }
        }
    }

    fn tracker(&self, target: &str) -> Option<Arc<Mutex<HealthTracker>>> {
        self.targets.get(target).map(|entry| Arc::clone(entry.value()))
    }

    /// Apply one outcome; `None` for an unknown target
    pub fn record_outcome(
        &self,
        target: &str,
        outcome: Outcome,
        latency: Duration,
        source: Source,
    ) -> Option<HealthStatus> {
        let tracker = self.tracker(target)?;
        let (effects, status) = {
            let mut tracker = tracker.lock();
            let effects = tracker.apply(outcome, latency, source);
            (effects, tracker.status)
        };
        self.publish(target, effects);
        Some(status)
    }

    pub fn status(&self, target: &str) -> Option<HealthStatus> {
        self.tracker(target).map(|t| t.lock().status)
    }

    pub fn is_disabled(&self, target: &str) -> bool {
        self.status(target) == Some(HealthStatus::Disabled)
    }

    pub fn record(&self, target: &str) -> Option<HealthRecord> {
        self.tracker(target).map(|t| t.lock().snapshot(target))
    }

    /// Every target's record, sorted by name
    pub fn summary(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self
            .targets
            .iter()
            .map(|entry| entry.value().lock().snapshot(entry.key()))
            .collect();
        records.sort_by(|a, b| a.target.cmp(&b.target));
        records
    }

    /// Operator override back to HEALTHY
    pub fn enable(&self, target: &str) -> bool {
        self.force(target, HealthStatus::Healthy)
    }

    /// Operator override to DISABLED
    pub fn disable(&self, target: &str) -> bool {
        self.force(target, HealthStatus::Disabled)
    }

    fn force(&self, target: &str, status: HealthStatus) -> bool {
        let Some(tracker) = self.tracker(target) else {
            return false;
        };
        let change = tracker.lock().force(status);
        self.publish(
            target,
            Effects {
                status_change: change,
                slow_p95: None,
            },
        );
        true
    }

    /// Run an out-of-band probe against `target` and record its outcome
    ///
    /// The probe is bounded by the target's `probe_timeout`; a timeout
    /// counts as a failure.
    pub async fn check_platform<F, Fut, T, E>(&self, target: &str, probe: F) -> Option<HealthRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let tracker = self.tracker(target)?;
        let timeout = tracker.lock().config.probe_timeout;

        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, probe()).await {
            Ok(Ok(_)) => Outcome::Success,
            Ok(Err(err)) => {
                tracing::warn!(target_name = %target, error = %err, "platform check failed");
                Outcome::Failure
            }
            Err(_) => {
                tracing::warn!(
                    target_name = %target,
                    timeout_ms = timeout.as_millis() as u64,
                    "platform check timed out"
                );
                Outcome::Failure
            }
        };

        self.record_outcome(target, outcome, started.elapsed(), Source::Probe);
        self.record(target)
    }

    /// Probe `target` every `probe_interval` until `shutdown` is cancelled
    pub fn spawn_probe_loop<F, Fut, T, E>(
        self: &Arc<Self>,
        target: &str,
        probe: F,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let period = self.tracker(target)?.lock().config.probe_interval;
        let monitor = Arc::clone(self);
        let target = target.to_string();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                target_name = %target,
                interval_ms = period.as_millis() as u64,
                "probe loop starting"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(
                            target_name = %target,
                            "probe loop received shutdown signal, exiting"
                        );
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.check_platform(&target, &probe).await;
                    }
                }
            }
        }))
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    /// Record and publish an alert
    pub fn raise_alert(&self, severity: Severity, target: &str, message: impl Into<String>) {
        let alert = Alert::new(severity, target, message);
        self.alerts.push(alert.clone());
        self.events.emit(Event::Alert(alert));
    }

    fn publish(&self, target: &str, effects: Effects) {
        if let Some((from, to)) = effects.status_change {
            self.events.emit(Event::StatusChange {
                target: target.to_string(),
                from,
                to,
            });
            let message = match to {
                HealthStatus::Healthy => format!("{target} recovered (was {from})"),
                _ => format!("{target} is {to} (was {from})"),
            };
            self.raise_alert(to.alert_severity(), target, message);
        }

        if let Some(p95) = effects.slow_p95 {
            self.raise_alert(
                Severity::Warning,
                target,
                format!("{target} p95 latency {}ms above threshold", p95.as_millis()),
            );
        }
    }
}
