//! Call records behind each circuit breaker
//!
//! Every breaker owns one `MemoryStorage`, so breakers never contend on a
//! shared lock. Time is read from tokio's clock so that paused-time tests
//! drive cooldowns and windows deterministically.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

/// Records kept per circuit before the oldest tenth is dropped
const MAX_RECORDS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    kind: CallKind,
    timestamp: f64,
}

/// Abstract storage backend for circuit breaker call records
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Record a successful operation
    fn record_success(&self, circuit_name: &str);

    /// Record a failed operation
    fn record_failure(&self, circuit_name: &str);

    /// Count successful operations within a time window
    fn success_count(&self, circuit_name: &str, window_seconds: f64) -> usize;

    /// Count failed operations within a time window
    fn failure_count(&self, circuit_name: &str, window_seconds: f64) -> usize;

    /// Clear all records for a circuit
    fn clear(&self, circuit_name: &str);

    /// Get monotonic time in seconds (relative to storage creation)
    fn monotonic_time(&self) -> f64;
}

/// Thread-safe in-memory storage for circuit breaker call records
#[derive(Debug)]
pub struct MemoryStorage {
    /// Records keyed by circuit name
    records: RwLock<HashMap<String, VecDeque<CallRecord>>>,
    /// Monotonic time anchor
    start_time: Instant,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    fn record(&self, circuit_name: &str, kind: CallKind) {
        let timestamp = self.monotonic_time();
        let mut records = self.records.write();
        let circuit_records = records.entry(circuit_name.to_string()).or_default();

        circuit_records.push_back(CallRecord { kind, timestamp });

        // Remove oldest 10% to avoid cleanup on every record
        if circuit_records.len() > MAX_RECORDS {
            circuit_records.drain(0..MAX_RECORDS / 10);
        }
    }

    fn count(&self, circuit_name: &str, kind: CallKind, window_seconds: f64) -> usize {
        let cutoff = self.monotonic_time() - window_seconds;
        let records = self.records.read();

        records
            .get(circuit_name)
            .map(|log| {
                log.iter()
                    .rev()
                    .take_while(|r| r.timestamp >= cutoff)
                    .filter(|r| r.kind == kind)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorage {
    fn record_success(&self, circuit_name: &str) {
        self.record(circuit_name, CallKind::Success);
    }

    fn record_failure(&self, circuit_name: &str) {
        self.record(circuit_name, CallKind::Failure);
    }

    fn success_count(&self, circuit_name: &str, window_seconds: f64) -> usize {
        self.count(circuit_name, CallKind::Success, window_seconds)
    }

    fn failure_count(&self, circuit_name: &str, window_seconds: f64) -> usize {
        self.count(circuit_name, CallKind::Failure, window_seconds)
    }

    fn clear(&self, circuit_name: &str) {
        self.records.write().remove(circuit_name);
    }

    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}
