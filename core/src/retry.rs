//! Retry loop
//!
//! Runs an operation up to `max_attempts` times, classifying each failure,
//! sleeping a jittered backoff between attempts without blocking the
//! executor, and spending one unit of the global budget per retry. A request
//! that runs out of attempts is handed to the dead letter queue.

use crate::Outcome;
use crate::budget::RetryBudget;
use crate::classifier::{Classifier, Fault, FaultContext, FaultRecord};
use crate::dead_letter::DeadLetterQueue;
use crate::errors::{RetryError, RetryFailure, StopReason};
use crate::events::{Event, EventHub};
use crate::policy::RetryPolicy;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-request context
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    /// Cancelling aborts the in-flight attempt or backoff sleep
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    /// Stored with the dead letter entry if the request is exhausted
    pub payload: Option<Value>,
    pub(crate) replay_of: Option<Uuid>,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            deadline: None,
            payload: None,
            replay_of: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub(crate) fn replaying(mut self, id: Uuid) -> Self {
        self.replay_of = Some(id);
        self
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the caller cancels or the deadline passes
    pub async fn interrupted(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook into each attempt of a retried call
pub trait AttemptObserver: Send + Sync {
    /// Called as each attempt completes, in completion order
    fn on_attempt(&self, _attempt: u32, _outcome: Outcome, _latency: Duration) {}

    /// Asked before every retry; returning false stops the loop
    fn admits_retry(&self) -> bool {
        true
    }
}

/// Observer that watches nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl AttemptObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct RetryManager {
    budget: Arc<RetryBudget>,
    classifier: Arc<dyn Classifier>,
    events: EventHub,
    dead_letters: Option<DeadLetterQueue>,
}

impl RetryManager {
    pub fn new(
        budget: Arc<RetryBudget>,
        classifier: Arc<dyn Classifier>,
        events: EventHub,
        dead_letters: Option<DeadLetterQueue>,
    ) -> Self {
        Self {
            budget,
            classifier,
            events,
            dead_letters,
        }
    }

    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    /// Run `op` under `policy`
    ///
    /// The first attempt is free; every retry must win one unit of the
    /// global budget after its backoff sleep.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        target: &str,
        policy: &RetryPolicy,
        mut op: F,
        ctx: &CallContext,
        observer: &dyn AttemptObserver,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Fault>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut previous_delay = policy.initial_delay;

        loop {
            if ctx.is_interrupted() {
                return Err(self.cancelled(target, ctx, attempt, started));
            }

            attempt += 1;
            let attempt_started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = ctx.interrupted() => None,
                result = run_attempt(op(), policy.attempt_timeout) => Some(result),
            };
            let latency = attempt_started.elapsed();

            let fault = match result {
                None => {
                    observer.on_attempt(attempt, Outcome::Cancelled, latency);
                    return Err(self.cancelled(target, ctx, attempt, started));
                }
                Some(Ok(value)) => {
                    observer.on_attempt(attempt, Outcome::Success, latency);
                    if attempt > 1 {
                        self.events.emit(Event::RetrySuccess {
                            target: target.to_string(),
                            request_id: ctx.request_id.clone(),
                            attempts: attempt,
                        });
                    }
                    return Ok(value);
                }
                Some(Err(fault)) => fault,
            };
            observer.on_attempt(attempt, Outcome::Failure, latency);

            let record = self.classifier.classify(
                &fault,
                &FaultContext {
                    target,
                    request_id: &ctx.request_id,
                },
            );
            tracing::debug!(
                target_name = %target,
                request_id = %ctx.request_id,
                attempt,
                kind = %record.kind,
                latency_ms = latency.as_millis() as u64,
                "attempt failed"
            );

            let stop = if !policy.is_retryable(record.kind) {
                Some(StopReason::NonRetryable)
            } else if attempt >= policy.max_attempts {
                Some(StopReason::MaxAttempts)
            } else if !observer.admits_retry() {
                Some(StopReason::CircuitOpen)
            } else if !self.budget.can_consume() {
                Some(StopReason::BudgetExhausted)
            } else {
                None
            };
            if let Some(reason) = stop {
                return Err(self.exhausted(ctx, record, attempt, started, reason));
            }

            let mut delay = policy.next_delay(attempt, previous_delay);
            if let Some(hint) = record.retry_after_hint
                && hint > delay
            {
                delay = hint;
            }
            previous_delay = delay;

            self.events.emit(Event::Retry {
                target: target.to_string(),
                request_id: ctx.request_id.clone(),
                attempt: attempt + 1,
                delay_ms: delay.as_millis() as u64,
                kind: record.kind,
            });

            let interrupted = tokio::select! {
                biased;
                _ = ctx.interrupted() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                return Err(self.cancelled(target, ctx, attempt, started));
            }

            if !observer.admits_retry() {
                return Err(self.exhausted(ctx, record, attempt, started, StopReason::CircuitOpen));
            }
            if !self.budget.consume() {
                return Err(self.exhausted(
                    ctx,
                    record,
                    attempt,
                    started,
                    StopReason::BudgetExhausted,
                ));
            }
        }
    }

    fn cancelled(
        &self,
        target: &str,
        ctx: &CallContext,
        attempts: u32,
        started: Instant,
    ) -> RetryError {
        tracing::debug!(
            target_name = %target,
            request_id = %ctx.request_id,
            attempts,
            "call cancelled"
        );
        RetryError::Cancelled {
            attempts,
            elapsed: started.elapsed(),
        }
    }

    fn exhausted(
        &self,
        ctx: &CallContext,
        fault: FaultRecord,
        attempts: u32,
        started: Instant,
        reason: StopReason,
    ) -> RetryError {
        let dead_letter_id = self.dead_letter(ctx, &fault, attempts);

        self.events.emit(Event::RetryFailed {
            target: fault.target.clone(),
            request_id: ctx.request_id.clone(),
            attempts,
            kind: fault.kind,
            reason,
        });

        RetryError::Exhausted(RetryFailure {
            fault,
            attempts,
            elapsed: started.elapsed(),
            dead_lettered: dead_letter_id.is_some(),
            dead_letter_id,
            reason,
        })
    }

    /// Persist the failed request; a storage failure is logged, never raised
    fn dead_letter(&self, ctx: &CallContext, fault: &FaultRecord, attempts: u32) -> Option<Uuid> {
        let queue = self.dead_letters.as_ref()?;
        let stored = match ctx.replay_of {
            Some(id) => queue.record_replay_failure(id, fault, attempts).map(|_| id),
            None => queue.record_exhausted(
                ctx.payload.clone().unwrap_or(Value::Null),
                fault,
                attempts,
            ),
        };

        match stored {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!(
                    target_name = %fault.target,
                    request_id = %ctx.request_id,
                    error = %err,
                    "failed to dead-letter request"
                );
                None
            }
        }
    }
}

async fn run_attempt<T, E, Fut>(attempt: Fut, timeout: Option<Duration>) -> Result<T, Fault>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<Fault>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result.map_err(Into::into),
            Err(elapsed) => Err(elapsed.into()),
        },
        None => attempt.await.map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::classifier::{DefaultClassifier, FaultKind};
    use crate::policy::{BackoffStrategy, Jitter};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn manager(per_minute: u32) -> (RetryManager, DeadLetterQueue, EventHub) {
        let events = EventHub::new(64);
        let dead_letters = DeadLetterQueue::in_memory();
        let budget = Arc::new(RetryBudget::new(BudgetConfig {
            max_per_minute: per_minute,
            ..Default::default()
        }));
        let manager = RetryManager::new(
            budget,
            Arc::new(DefaultClassifier),
            events.clone(),
            Some(dead_letters.clone()),
        );
        (manager, dead_letters, events)
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_strategy(BackoffStrategy::Exponential)
            .with_delays(Duration::from_millis(100), Duration::from_millis(2000))
            .with_jitter(Jitter::None)
            .with_max_attempts(max_attempts)
    }

    fn retry_delays(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<u64> {
        let mut delays = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Retry { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        delays
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let (manager, dead_letters, events) = manager(60);
        let mut rx = events.subscribe();
        let calls = AtomicU32::new(0);

        let result = manager
            .execute_with_retry(
                "search",
                &policy(5),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(Fault::new("connection reset by peer"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                &CallContext::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(result.expect("third attempt succeeds"), 3);
        assert_eq!(manager.budget().status().consumed_minute, 2);
        assert_eq!(retry_delays(&mut rx), vec![100, 200]);
        assert_eq!(dead_letters.stats().expect("stats").total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_schedule() {
        let (manager, _, events) = manager(60);
        let mut rx = events.subscribe();

        let result = manager
            .execute_with_retry(
                "search",
                &policy(8),
                || async { Err::<(), _>(Fault::status(503)) },
                &CallContext::new(),
                &NoopObserver,
            )
            .await;

        match result {
            Err(RetryError::Exhausted(failure)) => {
                assert_eq!(failure.attempts, 8);
                assert_eq!(failure.reason, StopReason::MaxAttempts);
                assert_eq!(failure.fault.kind, FaultKind::Network);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(retry_delays(&mut rx), vec![100, 200, 400, 800, 1600, 2000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let (manager, dead_letters, _) = manager(60);
        let calls = AtomicU32::new(0);
        let ctx = CallContext::new().with_payload(serde_json::json!({"user": 9}));

        let result = manager
            .execute_with_retry(
                "search",
                &policy(5),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(Fault::status(401)) }
                },
                &ctx,
                &NoopObserver,
            )
            .await;

        let Err(RetryError::Exhausted(failure)) = result else {
            panic!("expected exhaustion");
        };
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.reason, StopReason::NonRetryable);
        assert_eq!(failure.fault.kind, FaultKind::Auth);
        assert!(failure.dead_lettered);
        assert_eq!(manager.budget().status().consumed_minute, 0);

        let entry = dead_letters
            .get(failure.dead_letter_id.expect("id"))
            .expect("get")
            .expect("stored");
        assert_eq!(entry.request["user"], 9);
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_stops_retries() {
        let (manager, _, _) = manager(1);

        let result = manager
            .execute_with_retry(
                "search",
                &policy(5),
                || async { Err::<(), _>(Fault::new("ETIMEDOUT")) },
                &CallContext::new(),
                &NoopObserver,
            )
            .await;

        let Err(RetryError::Exhausted(failure)) = result else {
            panic!("expected exhaustion");
        };
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.reason, StopReason::BudgetExhausted);
        assert_eq!(manager.budget().status().remaining_minute, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_overrides_backoff() {
        let (manager, _, events) = manager(60);
        let mut rx = events.subscribe();
        let calls = AtomicU32::new(0);
        let policy = policy(3).with_delays(Duration::from_millis(200), Duration::from_millis(2000));

        let started = Instant::now();
        let result = manager
            .execute_with_retry(
                "search",
                &policy,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(Fault::status(429).with_retry_after(Duration::from_millis(5000)))
                        } else {
                            Ok("done")
                        }
                    }
                },
                &CallContext::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(result.expect("second attempt succeeds"), "done");
        assert_eq!(retry_delays(&mut rx), vec![5000]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(5000));
        assert!(elapsed < Duration::from_millis(5200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_smaller_hint_does_not_shorten_delay() {
        let (manager, _, events) = manager(60);
        let mut rx = events.subscribe();

        let _ = manager
            .execute_with_retry(
                "search",
                &policy(2).with_delays(Duration::from_millis(800), Duration::from_millis(2000)),
                || async {
                    Err::<(), _>(Fault::status(429).with_retry_after(Duration::from_millis(10)))
                },
                &CallContext::new(),
                &NoopObserver,
            )
            .await;

        assert_eq!(retry_delays(&mut rx), vec![800]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let (manager, dead_letters, _) = manager(60);
        let cancel = CancellationToken::new();
        let ctx = CallContext::new().with_cancel(cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = manager
            .execute_with_retry(
                "search",
                &policy(3).with_delays(Duration::from_secs(1), Duration::from_secs(2)),
                || async { Err::<(), _>(Fault::new("socket hang up")) },
                &ctx,
                &NoopObserver,
            )
            .await;
        canceller.await.expect("canceller");

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
        assert_eq!(manager.budget().status().consumed_minute, 0);
        assert_eq!(dead_letters.stats().expect("stats").total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_attempt() {
        let (manager, _, _) = manager(60);
        let ctx = CallContext::new().with_timeout(Duration::from_millis(100));
        let finished = AtomicBool::new(false);
        let flag = &finished;

        let result = manager
            .execute_with_retry(
                "search",
                &policy(3),
                move || async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, Fault>(())
                },
                &ctx,
                &NoopObserver,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_classifies_as_timeout() {
        let (manager, _, _) = manager(60);

        let result = manager
            .execute_with_retry(
                "search",
                &policy(2).with_attempt_timeout(Duration::from_millis(100)),
                || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, Fault>(())
                },
                &CallContext::new(),
                &NoopObserver,
            )
            .await;

        let Err(RetryError::Exhausted(failure)) = result else {
            panic!("expected exhaustion");
        };
        assert_eq!(failure.fault.kind, FaultKind::Timeout);
        assert_eq!(failure.attempts, 2);
    }

    struct ClosedAfterFirst {
        seen: AtomicU32,
    }

    impl AttemptObserver for ClosedAfterFirst {
        fn on_attempt(&self, _attempt: u32, _outcome: Outcome, _latency: Duration) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }

        fn admits_retry(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_can_stop_retries() {
        let (manager, _, _) = manager(60);
        let observer = ClosedAfterFirst {
            seen: AtomicU32::new(0),
        };

        let result = manager
            .execute_with_retry(
                "search",
                &policy(5),
                || async { Err::<(), _>(Fault::status(502)) },
                &CallContext::new(),
                &observer,
            )
            .await;

        let Err(RetryError::Exhausted(failure)) = result else {
            panic!("expected exhaustion");
        };
        assert_eq!(failure.reason, StopReason::CircuitOpen);
        assert_eq!(observer.seen.load(Ordering::SeqCst), 1);
    }
}
