//! Error types for protected calls

use crate::circuit::CircuitState;
use crate::classifier::FaultRecord;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Admission rejections from a circuit breaker
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CircuitError {
    /// Circuit is open, calls are being rejected
    #[error("circuit '{circuit}' is open (opened at {opened_at:.3}s, retry in {retry_in:?})")]
    Open {
        circuit: String,
        opened_at: f64,
        retry_in: Duration,
    },
    /// Half-open probe already in flight
    #[error("circuit '{circuit}' is half-open and its probe is already in flight")]
    ProbeInFlight { circuit: String },
}

/// Why the retry loop gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NonRetryable,
    MaxAttempts,
    BudgetExhausted,
    /// Breaker opened or target was disabled between attempts
    CircuitOpen,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::NonRetryable => "fault is not retryable",
            StopReason::MaxAttempts => "attempts exhausted",
            StopReason::BudgetExhausted => "retry budget exhausted",
            StopReason::CircuitOpen => "circuit opened between attempts",
        })
    }
}

/// Terminal failure of a protected request
#[derive(Debug, Clone, Error)]
#[error(
    "{target} failed after {attempts} attempt(s) in {elapsed:?}: {message} ({reason})",
    target = .fault.target,
    message = .fault.message
)]
pub struct RetryFailure {
    /// Classification of the last attempt's error
    pub fault: FaultRecord,
    pub attempts: u32,
    pub elapsed: Duration,
    pub dead_lettered: bool,
    pub dead_letter_id: Option<Uuid>,
    pub reason: StopReason,
}

/// Errors surfaced by the retry loop
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error(transparent)]
    Exhausted(RetryFailure),
    #[error("cancelled after {attempts} attempt(s) in {elapsed:?}")]
    Cancelled { attempts: u32, elapsed: Duration },
}

/// Errors returned by `Guard::protect`
#[derive(Debug, Clone, Error)]
pub enum ProtectError {
    /// Rejected by the breaker; the operation was not attempted
    #[error("target '{target}' rejected: circuit {state} (retry in {retry_in:?})")]
    CircuitOpen {
        target: String,
        state: CircuitState,
        retry_in: Duration,
    },
    /// Health monitor has disabled the target
    #[error("target '{target}' is disabled")]
    TargetDisabled { target: String },
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    #[error(transparent)]
    Exhausted(RetryFailure),
    #[error("call to '{target}' cancelled after {attempts} attempt(s) in {elapsed:?}")]
    Cancelled {
        target: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl ProtectError {
    /// The final fault, when the operation ran and failed
    pub fn fault(&self) -> Option<&FaultRecord> {
        match self {
            ProtectError::Exhausted(failure) => Some(&failure.fault),
            _ => None,
        }
    }

    /// Whether the call was turned away before running
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProtectError::CircuitOpen { .. }
                | ProtectError::TargetDisabled { .. }
                | ProtectError::UnknownTarget(_)
        )
    }

    pub(crate) fn from_retry(target: &str, err: RetryError) -> Self {
        match err {
            RetryError::Exhausted(failure) => ProtectError::Exhausted(failure),
            RetryError::Cancelled { attempts, elapsed } => ProtectError::Cancelled {
                target: target.to_string(),
                attempts,
                elapsed,
            },
        }
    }

    pub(crate) fn from_circuit(target: &str, err: CircuitError) -> Self {
        match err {
            CircuitError::Open { retry_in, .. } => ProtectError::CircuitOpen {
                target: target.to_string(),
                state: CircuitState::Open,
                retry_in,
            },
            CircuitError::ProbeInFlight { .. } => ProtectError::CircuitOpen {
                target: target.to_string(),
                state: CircuitState::HalfOpen,
                retry_in: Duration::ZERO,
            },
        }
    }
}
