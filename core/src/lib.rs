//! upstream-guard - resilience layer for calls to flaky upstream services
//!
//! This crate combines the pieces a service needs to call unreliable
//! upstreams safely:
//! - Fault classification into a fixed taxonomy with retryability defaults
//! - Per-target circuit breakers (Closed → Open → HalfOpen) built on a state machine
//! - A process-wide retry budget with per-minute and per-hour limits
//! - Backoff strategies with jitter, retry-after hints and cancellation
//! - Per-target health tracking with probes, latency percentiles and alerts
//! - A durable dead letter queue with replay
//!
//! # Example
//!
//! ```rust
//! use upstream_guard::{BreakerConfig, CallContext, Fault, Guard, HealthConfig, RetryPolicy};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = Guard::builder().build();
//! guard.register_target(
//!     "search_api",
//!     RetryPolicy::default(),
//!     BreakerConfig::default(),
//!     HealthConfig::default(),
//! )?;
//!
//! let hits = guard
//!     .protect(
//!         "search_api",
//!         || async { Ok::<_, Fault>(vec!["result"]) },
//!         &CallContext::new(),
//!     )
//!     .await?;
//! assert_eq!(hits.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod budget;
pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod dead_letter;
pub mod errors;
pub mod events;
pub mod guard;
pub mod health;
pub mod logging;
pub mod policy;
pub mod retry;
pub mod storage;

pub use alerts::{Alert, AlertLog, Severity};
pub use budget::{BudgetConfig, BudgetStatus, RetryBudget, WindowMode};
pub use builder::CircuitBuilder;
pub use circuit::{BreakerConfig, BreakerState, CallPermit, CircuitBreaker, CircuitState};
pub use classifier::{
    Classifier, DefaultClassifier, Fault, FaultContext, FaultKind, FaultRecord, PredicateClassifier,
};
pub use config::{ConfigError, GuardConfig, TargetConfig, load_config};
pub use dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterFilter, DeadLetterQueue, DeadLetterStats,
    DeadLetterStatus, DeadLetterStore, EntryChange, FileDeadLetterStore, MemoryDeadLetterStore,
    ReplayClaim,
};
pub use errors::{CircuitError, ProtectError, RetryError, RetryFailure, StopReason};
pub use events::{Event, EventHub};
pub use guard::{Guard, GuardBuilder, GuardError};
pub use health::{HealthConfig, HealthMonitor, HealthRecord, HealthStatus, Source};
pub use policy::{BackoffStrategy, Jitter, RetryPolicy};
pub use retry::{AttemptObserver, CallContext, NoopObserver, RetryManager};
pub use storage::{MemoryStorage, StorageBackend};

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
    /// Aborted by the caller; neither success nor failure
    Cancelled,
}
