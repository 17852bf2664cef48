//! Fault classification
//!
//! This module turns whatever an upstream call raised into a canonical
//! [`FaultKind`] plus a retryability verdict. Classification is a pure
//! function of the raw fault: status code, error code, message text and an
//! optional retry-after hint.

use crate::config::opt_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Canonical fault taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Network,
    Timeout,
    RateLimit,
    Auth,
    Blocked,
    Validation,
    Unknown,
}

impl FaultKind {
    /// Fixed retryability default for each kind
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            FaultKind::Network | FaultKind::Timeout | FaultKind::RateLimit
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Network => "network",
            FaultKind::Timeout => "timeout",
            FaultKind::RateLimit => "rate_limit",
            FaultKind::Auth => "auth",
            FaultKind::Blocked => "blocked",
            FaultKind::Validation => "validation",
            FaultKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw fault as raised by the wrapped operation
///
/// Every field is optional: an empty fault is valid input and classifies as
/// [`FaultKind::Unknown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fault {
    /// HTTP-like status code, if the upstream produced one
    pub status: Option<u16>,
    /// Machine-readable error code (`ECONNRESET`, `ETIMEDOUT`, ...)
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// Server-provided wait hint (e.g. a `Retry-After` header)
    pub retry_after: Option<Duration>,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Fault carrying only a status code
    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    fn describe(&self) -> String {
        match (self.status, self.code.as_deref(), self.message.as_deref()) {
            (_, _, Some(message)) if !message.trim().is_empty() => message.to_string(),
            (Some(status), Some(code), _) => format!("status {status} ({code})"),
            (Some(status), None, _) => format!("status {status}"),
            (None, Some(code), _) => code.to_string(),
            _ => "unrecognized fault".to_string(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for Fault {}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Fault::new(message)
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Fault::new(message)
    }
}

impl From<std::io::Error> for Fault {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            ErrorKind::ConnectionReset => Some("ECONNRESET"),
            ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
            ErrorKind::BrokenPipe => Some("EPIPE"),
            ErrorKind::NotConnected => Some("ENOTCONN"),
            ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
            ErrorKind::InvalidData | ErrorKind::InvalidInput => Some("EINVAL"),
            _ => None,
        };

        Fault {
            code: code.map(str::to_string),
            message: Some(err.to_string()),
            ..Fault::default()
        }
    }
}

impl From<tokio::time::error::Elapsed> for Fault {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Fault::new("attempt timed out").with_code("ETIMEDOUT")
    }
}

/// Context provided to classifiers alongside the raw fault
#[derive(Debug, Clone, Copy)]
pub struct FaultContext<'a> {
    /// Target the call was made against
    pub target: &'a str,
    /// Caller-supplied request id
    pub request_id: &'a str,
}

/// The classified, immutable view of a fault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub message: String,
    pub target: String,
    pub request_id: String,
    pub occurred_at: DateTime<Utc>,
    pub retryable: bool,
    #[serde(default, rename = "retry_after_hint_ms", with = "opt_millis")]
    pub retry_after_hint: Option<Duration>,
}

impl FaultRecord {
    /// Build a record for `fault` with the kind's default retryability
    pub fn new(kind: FaultKind, fault: &Fault, ctx: &FaultContext<'_>) -> Self {
        Self {
            kind,
            message: fault.describe(),
            target: ctx.target.to_string(),
            request_id: ctx.request_id.to_string(),
            occurred_at: Utc::now(),
            retryable: kind.is_retryable_by_default(),
            retry_after_hint: match kind {
                FaultKind::RateLimit => fault.retry_after,
                _ => None,
            },
        }
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault on '{}': {}", self.kind, self.target, self.message)
    }
}

/// Trait for classifying faults
///
/// Implementations must never panic, whatever the fault looks like.
pub trait Classifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, fault: &Fault, ctx: &FaultContext<'_>) -> FaultRecord;
}

const RATE_LIMIT_SIGNALS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "throttl",
    "quota exceeded",
];
const BLOCKED_SIGNALS: &[&str] = &[
    "captcha",
    "challenge",
    "bot detect",
    "blocked",
    "cloudflare",
    "access denied",
];
const AUTH_SIGNALS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "authentication",
    "invalid api key",
    "invalid token",
    "token expired",
];
const TIMEOUT_SIGNALS: &[&str] = &[
    "timeout",
    "timed out",
    "etimedout",
    "deadline exceeded",
    "esockettimedout",
];
const NETWORK_SIGNALS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "econnaborted",
    "enotfound",
    "eai_again",
    "epipe",
    "enotconn",
    "eaddrnotavail",
    "connection reset",
    "connection refused",
    "connection closed",
    "dns",
    "socket hang up",
    "broken pipe",
    "network",
];
const VALIDATION_SIGNALS: &[&str] = &[
    "validation",
    "invalid input",
    "schema",
    "malformed",
    "parse error",
    "missing field",
    "einval",
];

/// Default policy classifier
///
/// Rules are checked in order: rate limiting, blocking, auth, timeouts,
/// network, validation. Anything unmatched is `Unknown` and not retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl DefaultClassifier {
    /// Determine the kind of a fault without building a record
    pub fn kind_of(fault: &Fault) -> FaultKind {
        let text = format!(
            "{} {}",
            fault.code.as_deref().unwrap_or_default(),
            fault.message.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        let mentions = |signals: &[&str]| signals.iter().any(|s| text.contains(s));

        match fault.status {
            Some(429) => return FaultKind::RateLimit,
            _ if mentions(RATE_LIMIT_SIGNALS) => return FaultKind::RateLimit,
            _ => {}
        }

        if mentions(BLOCKED_SIGNALS) {
            return FaultKind::Blocked;
        }

        match fault.status {
            Some(401 | 403) => FaultKind::Auth,
            Some(408 | 504) => FaultKind::Timeout,
            Some(502 | 503) => FaultKind::Network,
            Some(400 | 422) => FaultKind::Validation,
            _ if mentions(AUTH_SIGNALS) => FaultKind::Auth,
            _ if mentions(TIMEOUT_SIGNALS) => FaultKind::Timeout,
            _ if mentions(NETWORK_SIGNALS) => FaultKind::Network,
            _ if mentions(VALIDATION_SIGNALS) => FaultKind::Validation,
            _ => FaultKind::Unknown,
        }
    }
}

impl Classifier for DefaultClassifier {
    fn classify(&self, fault: &Fault, ctx: &FaultContext<'_>) -> FaultRecord {
        FaultRecord::new(Self::kind_of(fault), fault, ctx)
    }
}

/// Predicate-based classifier using a closure
///
/// The closure gets first pick; returning `None` falls back to
/// [`DefaultClassifier`].
pub struct PredicateClassifier<F>
where
    F: Fn(&Fault) -> Option<FaultKind> + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&Fault) -> Option<FaultKind> + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> Classifier for PredicateClassifier<F>
where
    F: Fn(&Fault) -> Option<FaultKind> + Send + Sync,
{
    fn classify(&self, fault: &Fault, ctx: &FaultContext<'_>) -> FaultRecord {
        let kind = (self.predicate)(fault).unwrap_or_else(|| DefaultClassifier::kind_of(fault));
        FaultRecord::new(kind, fault, ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&Fault) -> Option<FaultKind> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
