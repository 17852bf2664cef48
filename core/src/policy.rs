//! Per-target retry policy: backoff strategies and jitter

use crate::classifier::FaultKind;
use crate::config::{millis, opt_millis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// How the pre-jitter delay grows with the retry number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `initial_delay`
    Fixed,
    /// `initial_delay * n`
    Linear,
    /// `initial_delay * multiplier^(n-1)`
    #[default]
    Exponential,
    /// `initial_delay * fib(n)` with fib(1) = fib(2) = 1
    Fibonacci,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    None,
    /// uniform(0, d)
    #[default]
    Full,
    /// d/2 + uniform(0, d/2)
    Equal,
    /// min(max_delay, uniform(initial_delay, previous * 3))
    Decorrelated,
}

fn default_retryable_kinds() -> BTreeSet<FaultKind> {
    [FaultKind::Network, FaultKind::Timeout, FaultKind::RateLimit]
        .into_iter()
        .collect()
}

/// Retry configuration for one target
///
/// `max_attempts` counts every execution including the first, so
/// `max_attempts = 1` disables retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub jitter: Jitter,
    pub retryable_kinds: BTreeSet<FaultKind>,
    /// Upper bound for a single attempt
    #[serde(rename = "attempt_timeout_ms", with = "opt_millis")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 3,
            jitter: Jitter::Full,
            retryable_kinds: default_retryable_kinds(),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = FaultKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn is_retryable(&self, kind: FaultKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Pre-jitter delay before retry number `retry` (1-based), capped at
    /// `max_delay`
    pub fn base_delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let factor = match self.strategy {
            BackoffStrategy::Fixed => 1.0,
            BackoffStrategy::Linear => f64::from(retry),
            BackoffStrategy::Exponential => self.multiplier.powi((retry - 1) as i32),
            BackoffStrategy::Fibonacci => fibonacci(retry),
        };
        self.scaled(factor)
    }

    fn scaled(&self, factor: f64) -> Duration {
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Randomize `delay`; `previous` is the last actually-slept delay and
    /// only matters for decorrelated jitter
    pub fn apply_jitter(&self, delay: Duration, previous: Duration) -> Duration {
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => proportional_jitter(delay, 1.0),
            Jitter::Equal => proportional_jitter(delay, 0.5),
            Jitter::Decorrelated => {
                let low = self.initial_delay.as_millis() as u64;
                let high = (previous.max(self.initial_delay).as_millis() as u64).saturating_mul(3);
                let sampled = if high > low {
                    fastrand::u64(low..=high)
                } else {
                    low
                };
                Duration::from_millis(sampled).min(self.max_delay)
            }
        }
    }

    /// Jittered delay for retry number `retry`
    pub fn next_delay(&self, retry: u32, previous: Duration) -> Duration {
        self.apply_jitter(self.base_delay(retry), previous)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if self.max_delay < self.initial_delay {
            problems.push("max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            problems.push(format!("multiplier {} must be finite and >= 1.0", self.multiplier));
        }
        if self.attempt_timeout == Some(Duration::ZERO) {
            problems.push("attempt_timeout_ms must be positive".to_string());
        }
        problems
    }
}

/// `d * (1 - factor + rand * factor)`, sampled through chrono-machines
fn proportional_jitter(delay: Duration, factor: f64) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    if delay_ms == 0 {
        return delay;
    }
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: delay_ms,
        multiplier: 1.0,
        max_delay_ms: delay_ms,
    };
    Duration::from_millis(policy.calculate_delay(1, factor) as u64)
}

fn fibonacci(n: u32) -> f64 {
    let (mut current, mut next) = (1.0_f64, 1.0_f64);
    for _ in 1..n {
        (current, next) = (next, current + next);
    }
    current
}
