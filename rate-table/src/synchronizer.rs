use crate::analytics::{AnalyticsSource, FetchError};
use crate::metrics_defs::{
    SYNC_DURATION, SYNC_ENTRIES, SYNC_EVICTIONS, SYNC_FAILURES, SYNC_REJECTED_ROWS,
};
use crate::store::{FastCache, PersistentStore, StoreError};
use crate::types::{EntryKey, MANIFEST_KEY, RateEntry, TableManifest, TableSnapshot};
use parking_lot::{Mutex, RwLock};
use shared::{counter, gauge, histogram};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Diffing,
    Publishing,
    /// The last cycle failed. The next cycle starts over from `Idle`.
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Fetching => "fetching",
            SyncState::Diffing => "diffing",
            SyncState::Publishing => "publishing",
            SyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("cycle exceeded deadline of {0:?}")]
    Timeout(Duration),
    #[error("another synchronization cycle is in progress")]
    ConcurrentCycle,
    #[error("publish partially failed: {} of {attempted} operations failed", .failed.len())]
    PublishPartialFailure { failed: Vec<String>, attempted: usize },
    #[error("synchronizer worker has stopped")]
    WorkerStopped,
}

impl SyncError {
    fn reason(&self) -> &'static str {
        match self {
            SyncError::Fetch(_) => "fetch",
            SyncError::Timeout(_) => "timeout",
            SyncError::ConcurrentCycle => "concurrent",
            SyncError::PublishPartialFailure { .. } => "partial_publish",
            SyncError::WorkerStopped => "worker_stopped",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub rows_fetched: usize,
    pub rejected: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub evicted: usize,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct TableDiff {
    new: usize,
    changed: usize,
    unchanged: usize,
    evict: Vec<String>,
}

#[derive(Debug, Default)]
struct PublishOutcome {
    attempted: usize,
    failed: Vec<String>,
    // Keys whose deletion failed in at least one backend
    not_evicted: Vec<String>,
}

/// The only writer of the rate table. Each cycle pulls a full snapshot from
/// the analytics source, writes every entry to the persistent store and the
/// fast cache, publishes the manifest and evicts keys absent from the snapshot.
pub struct Synchronizer {
    source: Arc<dyn AnalyticsSource>,
    store: Arc<dyn PersistentStore>,
    cache: Arc<dyn FastCache>,
    cycle_timeout: Duration,
    update_lock: Semaphore,
    state: RwLock<SyncState>,
    // Content of the last published snapshot, used for diffing.
    published: RwLock<HashMap<EntryKey, RateEntry>>,
    // Every key that may currently exist in either backend.
    known_keys: Mutex<HashSet<String>>,
    cycle: AtomicU64,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn AnalyticsSource>,
        store: Arc<dyn PersistentStore>,
        cache: Arc<dyn FastCache>,
        cycle_timeout: Duration,
    ) -> Self {
        Synchronizer {
            source,
            store,
            cache,
            cycle_timeout,
            update_lock: Semaphore::new(1),
            state: RwLock::new(SyncState::Idle),
            published: RwLock::new(HashMap::new()),
            known_keys: Mutex::new(HashSet::new()),
            cycle: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn published_len(&self) -> usize {
        self.published.read().len()
    }

    fn set_state(&self, state: SyncState) {
        tracing::debug!(%state, "synchronizer state change");
        *self.state.write() = state;
    }

    /// Runs one full synchronization cycle. Rejects the call with
    /// `ConcurrentCycle` while another cycle holds the permit.
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        let _permit = self
            .update_lock
            .try_acquire()
            .map_err(|_| SyncError::ConcurrentCycle)?;

        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        self.set_state(SyncState::Idle);

        let result = match tokio::time::timeout(self.cycle_timeout, self.run_phases(cycle)).await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.cycle_timeout)),
        };

        let elapsed = started.elapsed();
        histogram!(SYNC_DURATION).record(elapsed.as_secs_f64());

        match result {
            Ok(mut report) => {
                report.duration = elapsed;
                self.set_state(SyncState::Idle);
                gauge!(SYNC_ENTRIES)
                    .set(report.new as f64 + report.changed as f64 + report.unchanged as f64);
                tracing::info!(
                    cycle,
                    rows = report.rows_fetched,
                    rejected = report.rejected,
                    new = report.new,
                    changed = report.changed,
                    unchanged = report.unchanged,
                    evicted = report.evicted,
                    duration_ms = elapsed.as_millis() as u64,
                    "rate table published"
                );
                Ok(report)
            }
            Err(err) => {
                self.set_state(SyncState::Failed);
                counter!(SYNC_FAILURES, "reason" => err.reason()).increment(1);
                tracing::error!(cycle, error = %err, "rate table synchronization failed");
                Err(err)
            }
        }
    }

    async fn run_phases(&self, cycle: u64) -> Result<CycleReport, SyncError> {
        self.set_state(SyncState::Fetching);
        let rows = self.source.fetch().await?;
        let rows_fetched = rows.len();

        let (snapshot, rejected) = TableSnapshot::from_rows(rows);
        for err in &rejected {
            tracing::warn!(error = %err, "rejected malformed row");
        }
        counter!(SYNC_REJECTED_ROWS).increment(rejected.len() as u64);

        self.set_state(SyncState::Diffing);
        let stored_keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                // Eviction still covers every key this process has written
                tracing::warn!(error = %err, "could not list stored keys");
                Vec::new()
            }
        };
        let diff = self.diff(&snapshot, stored_keys);

        self.set_state(SyncState::Publishing);
        self.known_keys
            .lock()
            .extend(snapshot.keys().map(|k| k.to_string()));

        let outcome = self.publish(cycle, &snapshot, &diff.evict).await;

        {
            let mut known_keys = self.known_keys.lock();
            *known_keys = snapshot.keys().map(|k| k.to_string()).collect();
            known_keys.extend(outcome.not_evicted.iter().cloned());
        }
        *self.published.write() = snapshot
            .entries()
            .map(|e| (e.key().clone(), e.clone()))
            .collect();

        let evicted = diff.evict.len() - outcome.not_evicted.len();
        counter!(SYNC_EVICTIONS).increment(evicted as u64);

        if !outcome.failed.is_empty() {
            return Err(SyncError::PublishPartialFailure {
                failed: outcome.failed,
                attempted: outcome.attempted,
            });
        }

        Ok(CycleReport {
            cycle,
            rows_fetched,
            rejected: rejected.len(),
            new: diff.new,
            changed: diff.changed,
            unchanged: diff.unchanged,
            evicted,
            duration: Duration::ZERO,
        })
    }

    fn diff(&self, snapshot: &TableSnapshot, stored_keys: Vec<String>) -> TableDiff {
        let mut diff = TableDiff::default();

        {
            let published = self.published.read();
            for entry in snapshot.entries() {
                match published.get(entry.key()) {
                    None => diff.new += 1,
                    Some(previous) if previous.same_content(entry) => diff.unchanged += 1,
                    Some(_) => diff.changed += 1,
                }
            }
        }

        let incoming: HashSet<String> = snapshot.keys().map(|k| k.to_string()).collect();
        let mut candidates: HashSet<String> = self.known_keys.lock().clone();
        candidates.extend(stored_keys);

        diff.evict = candidates
            .into_iter()
            .filter(|key| key != MANIFEST_KEY && !incoming.contains(key))
            .collect();
        diff.evict.sort();
        diff
    }

    async fn publish(
        &self,
        cycle: u64,
        snapshot: &TableSnapshot,
        evict: &[String],
    ) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        for entry in snapshot.entries() {
            let key = entry.key().to_string();
            outcome.attempted += 1;

            let value = match entry.to_bytes() {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(%key, error = %err, "could not encode entry");
                    outcome.failed.push(key);
                    continue;
                }
            };
            if let Err(err) = self.write_both(&key, value).await {
                tracing::warn!(%key, error = %err, "could not write entry");
                outcome.failed.push(key);
            }
        }

        // The manifest goes out after all entries and before any eviction.
        outcome.attempted += 1;
        if let Err(err) = self.write_manifest(cycle, snapshot).await {
            tracing::warn!(error = %err, "could not write manifest");
            outcome.failed.push(MANIFEST_KEY.to_string());
        }

        for key in evict {
            outcome.attempted += 1;
            let store_result = self.store.delete(key).await;
            let cache_result = self.cache.delete(key).await;
            if let Err(err) = store_result.and(cache_result) {
                tracing::warn!(%key, error = %err, "could not evict entry");
                outcome.failed.push(key.clone());
                outcome.not_evicted.push(key.clone());
            } else {
                tracing::debug!(%key, "evicted entry");
            }
        }

        outcome
    }

    /// Store first, then cache. A failed store write leaves the cache untouched
    /// so both keep the previous value.
    async fn write_both(&self, key: &str, value: bytes::Bytes) -> Result<(), StoreError> {
        self.store.put(key, value.clone()).await?;
        self.cache.set(key, value).await
    }

    async fn write_manifest(&self, cycle: u64, snapshot: &TableSnapshot) -> Result<(), StoreError> {
        let mut keys: Vec<String> = snapshot.keys().map(|k| k.to_string()).collect();
        keys.sort();
        let published_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let manifest = TableManifest {
            cycle,
            published_at,
            keys,
        };
        let value = manifest
            .to_bytes()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.write_both(MANIFEST_KEY, value).await
    }
}
