//! Dead letter storage for requests that exhausted their retries
//!
//! Entries are never dropped implicitly: replay marks them `Reprocessed`,
//! discard marks them `Discarded`, and only an explicit purge removes one.

use crate::classifier::FaultRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const FILE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Reprocessed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub target: String,
    pub request_id: String,
    /// Opaque payload handed back to the replay handler
    pub request: Value,
    pub last_fault: FaultRecord,
    /// Attempts across the original call and every replay
    pub attempts: u32,
    #[serde(default)]
    pub replays: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub target: Option<String>,
    pub status: Option<DeadLetterStatus>,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(DeadLetterStatus::Pending),
            ..Self::default()
        }
    }

    pub fn for_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.target.as_deref().is_none_or(|t| t == entry.target)
            && self.status.is_none_or(|s| s == entry.status)
    }

    fn apply<'a>(
        &self,
        entries: impl Iterator<Item = &'a DeadLetterEntry>,
    ) -> Vec<DeadLetterEntry> {
        entries
            .filter(|e| self.matches(e))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub pending: usize,
    pub reprocessed: usize,
    pub discarded: usize,
    /// Pending entries per target
    pub pending_by_target: BTreeMap<String, usize>,
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead letter IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dead letter encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("dead letter {0} not found")]
    NotFound(Uuid),
    #[error("dead letter {id} is already {status:?}")]
    AlreadyResolved { id: Uuid, status: DeadLetterStatus },
    #[error("dead letter {0} is already being replayed")]
    ReplayInFlight(Uuid),
}

/// In-place edit applied to one entry under the store lock
pub type EntryChange<'a> = &'a mut dyn FnMut(&mut DeadLetterEntry) -> Result<(), DeadLetterError>;

/// Storage backend for dead letter entries
pub trait DeadLetterStore: Send + Sync + std::fmt::Debug {
    fn append(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError>;

    /// Matching entries in insertion order
    fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, DeadLetterError>;

    /// Apply `change` to the entry atomically and return the result
    ///
    /// An error from `change` leaves the stored entry untouched.
    fn update(&self, id: Uuid, change: EntryChange<'_>) -> Result<DeadLetterEntry, DeadLetterError>;

    fn remove(&self, id: Uuid) -> Result<DeadLetterEntry, DeadLetterError>;
}

fn position(entries: &[DeadLetterEntry], id: Uuid) -> Result<usize, DeadLetterError> {
    entries
        .iter()
        .position(|e| e.id == id)
        .ok_or(DeadLetterError::NotFound(id))
}

/// In-memory store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeadLetterStore for MemoryDeadLetterStore {
    fn append(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        self.entries.lock().push(entry);
        Ok(())
    }

    fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        Ok(filter.apply(self.entries.lock().iter()))
    }

    fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        Ok(self.entries.lock().iter().find(|e| e.id == id).cloned())
    }

    fn update(
        &self,
        id: Uuid,
        change: EntryChange<'_>,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let mut entries = self.entries.lock();
        let index = position(&entries, id)?;
        let mut next = entries[index].clone();
        change(&mut next)?;
        entries[index] = next.clone();
        Ok(next)
    }

    fn remove(&self, id: Uuid) -> Result<DeadLetterEntry, DeadLetterError> {
        let mut entries = self.entries.lock();
        let index = position(&entries, id)?;
        Ok(entries.remove(index))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DeadLetterFile {
    version: u32,
    entries: Vec<DeadLetterEntry>,
}

/// JSON-file store
///
/// The whole document is rewritten through a temp file and renamed into
/// place on every mutation, so a crash leaves either the old or the new
/// document on disk.
#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl FileDeadLetterStore {
    /// Open `path`, loading existing entries when the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DeadLetterError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str::<DeadLetterFile>(&content)?.entries
            }
        } else {
            Vec::new()
        };

        tracing::debug!(
            path = %path.display(),
            entries = entries.len(),
            "dead letter store opened"
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy, persist it, then commit in memory
    fn mutate<R>(
        &self,
        change: impl FnOnce(&mut Vec<DeadLetterEntry>) -> Result<R, DeadLetterError>,
    ) -> Result<R, DeadLetterError> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        let result = change(&mut next)?;
        self.persist(&next)?;
        *entries = next;
        Ok(result)
    }

    fn persist(&self, entries: &[DeadLetterEntry]) -> Result<(), DeadLetterError> {
        let document = serde_json::to_vec_pretty(&DeadLetterFile {
            version: FILE_FORMAT_VERSION,
            entries: entries.to_vec(),
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, document)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DeadLetterStore for FileDeadLetterStore {
    fn append(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        self.mutate(|entries| {
            entries.push(entry);
            Ok(())
        })
    }

    fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        Ok(filter.apply(self.entries.lock().iter()))
    }

    fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        Ok(self.entries.lock().iter().find(|e| e.id == id).cloned())
    }

    fn update(
        &self,
        id: Uuid,
        change: EntryChange<'_>,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        self.mutate(|entries| {
            let index = position(entries, id)?;
            change(&mut entries[index])?;
            Ok(entries[index].clone())
        })
    }

    fn remove(&self, id: Uuid) -> Result<DeadLetterEntry, DeadLetterError> {
        self.mutate(|entries| {
            let index = position(entries, id)?;
            Ok(entries.remove(index))
        })
    }
}

fn ensure_pending(entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
    match entry.status {
        DeadLetterStatus::Pending => Ok(()),
        status => Err(DeadLetterError::AlreadyResolved { id: entry.id, status }),
    }
}

/// Exclusive right to replay one pending entry
///
/// At most one claim exists per entry; dropping it lets the entry be
/// claimed again.
#[derive(Debug)]
pub struct ReplayClaim {
    entry: DeadLetterEntry,
    replaying: Arc<Mutex<HashSet<Uuid>>>,
}

impl ReplayClaim {
    /// The entry as it was when claimed
    pub fn entry(&self) -> &DeadLetterEntry {
        &self.entry
    }
}

impl Drop for ReplayClaim {
    fn drop(&mut self) {
        self.replaying.lock().remove(&self.entry.id);
    }
}

/// Dead letter operations over any backend
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    /// Entries with a live `ReplayClaim`
    replaying: Arc<Mutex<HashSet<Uuid>>>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            store,
            replaying: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDeadLetterStore::new()))
    }

    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self, DeadLetterError> {
        Ok(Self::new(Arc::new(FileDeadLetterStore::open(path)?)))
    }

    /// Store a request that ran out of attempts
    pub fn record_exhausted(
        &self,
        request: Value,
        fault: &FaultRecord,
        attempts: u32,
    ) -> Result<Uuid, DeadLetterError> {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            target: fault.target.clone(),
            request_id: fault.request_id.clone(),
            request,
            last_fault: fault.clone(),
            attempts,
            replays: 0,
            first_failed_at: fault.occurred_at,
            last_failed_at: fault.occurred_at,
            status: DeadLetterStatus::Pending,
        };
        let id = entry.id;
        self.store.append(entry)?;

        tracing::info!(
            dead_letter_id = %id,
            target_name = %fault.target,
            kind = %fault.kind,
            attempts,
            "request dead-lettered"
        );
        Ok(id)
    }

    /// Claim a pending entry for replay
    ///
    /// Fails with `ReplayInFlight` while another claim on `id` is alive.
    pub fn begin_replay(&self, id: Uuid) -> Result<ReplayClaim, DeadLetterError> {
        let mut replaying = self.replaying.lock();
        if replaying.contains(&id) {
            return Err(DeadLetterError::ReplayInFlight(id));
        }
        let entry = self.store.get(id)?.ok_or(DeadLetterError::NotFound(id))?;
        ensure_pending(&entry)?;

        replaying.insert(id);
        Ok(ReplayClaim {
            entry,
            replaying: Arc::clone(&self.replaying),
        })
    }

    /// Fold a failed replay into the existing entry; it stays pending
    pub fn record_replay_failure(
        &self,
        id: Uuid,
        fault: &FaultRecord,
        attempts: u32,
    ) -> Result<(), DeadLetterError> {
        self.store.update(id, &mut |entry: &mut DeadLetterEntry| {
            ensure_pending(entry)?;
            entry.attempts += attempts;
            entry.replays += 1;
            entry.last_fault = fault.clone();
            entry.last_failed_at = fault.occurred_at;
            Ok(())
        })?;

        tracing::info!(dead_letter_id = %id, kind = %fault.kind, "dead letter replay failed");
        Ok(())
    }

    /// Resolve a successful replay, releasing its claim
    pub fn mark_reprocessed(&self, claim: ReplayClaim) -> Result<(), DeadLetterError> {
        self.resolve(claim.entry.id, DeadLetterStatus::Reprocessed)
    }

    /// Mark as discarded; the entry stays stored for audit
    pub fn discard(&self, id: Uuid) -> Result<(), DeadLetterError> {
        let replaying = self.replaying.lock();
        if replaying.contains(&id) {
            return Err(DeadLetterError::ReplayInFlight(id));
        }
        self.resolve(id, DeadLetterStatus::Discarded)
    }

    fn resolve(&self, id: Uuid, status: DeadLetterStatus) -> Result<(), DeadLetterError> {
        self.store.update(id, &mut |entry: &mut DeadLetterEntry| {
            ensure_pending(entry)?;
            if status == DeadLetterStatus::Reprocessed {
                entry.replays += 1;
            }
            entry.status = status;
            Ok(())
        })?;
        tracing::info!(dead_letter_id = %id, ?status, "dead letter resolved");
        Ok(())
    }

    /// Permanently remove an entry
    pub fn purge(&self, id: Uuid) -> Result<DeadLetterEntry, DeadLetterError> {
        let replaying = self.replaying.lock();
        if replaying.contains(&id) {
            return Err(DeadLetterError::ReplayInFlight(id));
        }
        let entry = self.store.remove(id)?;
        drop(replaying);
        tracing::warn!(dead_letter_id = %id, target_name = %entry.target, "dead letter purged");
        Ok(entry)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.store.list(filter)
    }

    pub fn stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        let entries = self.store.list(&DeadLetterFilter::default())?;
        let mut stats = DeadLetterStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            match entry.status {
                DeadLetterStatus::Pending => {
                    stats.pending += 1;
                    *stats.pending_by_target.entry(entry.target.clone()).or_default() += 1;
                }
                DeadLetterStatus::Reprocessed => stats.reprocessed += 1,
                DeadLetterStatus::Discarded => stats.discarded += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Fault, FaultContext, FaultKind};
    use serde_json::json;

    fn fault(target: &str) -> FaultRecord {
        FaultRecord::new(
            FaultKind::Network,
            &Fault::new("connection reset"),
            &FaultContext {
                target,
                request_id: "req-7",
            },
        )
    }

    #[test]
    fn test_lifecycle_in_memory() {
        let queue = DeadLetterQueue::in_memory();
        let id = queue
            .record_exhausted(json!({"q": "rust"}), &fault("search"), 3)
            .expect("append");

        let claim = queue.begin_replay(id).expect("pending");
        assert_eq!(claim.entry().request["q"], "rust");
        assert_eq!(claim.entry().attempts, 3);

        queue.record_replay_failure(id, &fault("search"), 2).expect("update");
        let entry = queue.get(id).expect("get").expect("present");
        assert_eq!(entry.attempts, 5);
        assert_eq!(entry.replays, 1);
        assert_eq!(entry.status, DeadLetterStatus::Pending);

        queue.mark_reprocessed(claim).expect("resolve");
        assert!(matches!(
            queue.begin_replay(id),
            Err(DeadLetterError::AlreadyResolved {
                status: DeadLetterStatus::Reprocessed,
                ..
            })
        ));
    }

    #[test]
    fn test_replay_claim_is_exclusive() {
        let queue = DeadLetterQueue::in_memory();
        let id = queue.record_exhausted(Value::Null, &fault("search"), 1).expect("append");

        let claim = queue.begin_replay(id).expect("first claim");
        assert!(matches!(queue.begin_replay(id), Err(DeadLetterError::ReplayInFlight(_))));
        assert!(matches!(queue.discard(id), Err(DeadLetterError::ReplayInFlight(_))));

        drop(claim);
        let claim = queue.begin_replay(id).expect("released on drop");
        queue.mark_reprocessed(claim).expect("resolve");
        assert_eq!(queue.stats().expect("stats").reprocessed, 1);
    }

    #[test]
    fn test_late_replay_failure_cannot_reopen_resolved_entry() {
        let queue = DeadLetterQueue::in_memory();
        let id = queue.record_exhausted(Value::Null, &fault("search"), 1).expect("append");
        let claim = queue.begin_replay(id).expect("claim");
        queue.mark_reprocessed(claim).expect("resolve");

        assert!(matches!(
            queue.record_replay_failure(id, &fault("search"), 3),
            Err(DeadLetterError::AlreadyResolved { .. })
        ));
        let entry = queue.get(id).expect("get").expect("present");
        assert_eq!(entry.status, DeadLetterStatus::Reprocessed);
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn test_discard_keeps_entry_and_purge_removes() {
        let queue = DeadLetterQueue::in_memory();
        let kept = queue.record_exhausted(Value::Null, &fault("search"), 1).expect("append");
        let gone = queue.record_exhausted(Value::Null, &fault("billing"), 1).expect("append");

        queue.discard(kept).expect("discard");
        queue.purge(gone).expect("purge");

        let stats = queue.stats().expect("stats");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.pending, 0);
        assert!(matches!(queue.purge(gone), Err(DeadLetterError::NotFound(_))));
    }

    #[test]
    fn test_filters() {
        let queue = DeadLetterQueue::in_memory();
        for target in ["search", "search", "billing"] {
            queue.record_exhausted(Value::Null, &fault(target), 1).expect("append");
        }

        let search = queue
            .list(&DeadLetterFilter::pending().for_target("search"))
            .expect("list");
        assert_eq!(search.len(), 2);
        assert_eq!(queue.list(&DeadLetterFilter::default().limit(1)).expect("list").len(), 1);

        let stats = queue.stats().expect("stats");
        assert_eq!(stats.pending_by_target["search"], 2);
        assert_eq!(stats.pending_by_target["billing"], 1);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("dead_letters.json");

        let id = {
            let queue = DeadLetterQueue::open_file(&path).expect("open");
            let id = queue
                .record_exhausted(json!({"order": 42}), &fault("billing"), 4)
                .expect("append");
            queue.record_exhausted(Value::Null, &fault("search"), 1).expect("append");
            id
        };

        let reopened = DeadLetterQueue::open_file(&path).expect("reopen");
        let entry = reopened.get(id).expect("get").expect("persisted");
        assert_eq!(entry.request, json!({"order": 42}));
        assert_eq!(entry.last_fault.kind, FaultKind::Network);
        assert_eq!(reopened.stats().expect("stats").total, 2);

        reopened.discard(id).expect("discard");
        let again = DeadLetterQueue::open_file(&path).expect("reopen");
        assert_eq!(again.get(id).expect("get").expect("kept").status, DeadLetterStatus::Discarded);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("dead_letters.json");
        fs::write(&path, "{not json").expect("write");

        assert!(matches!(
            FileDeadLetterStore::open(&path),
            Err(DeadLetterError::Json(_))
        ));
    }
}
