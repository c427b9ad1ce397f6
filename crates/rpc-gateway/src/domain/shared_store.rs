//! # Shared Pending-State Backend
//!
//! Externalises pending-entry metadata into a key-value store with per-entry
//! expiry, so several gateway processes can see each other's outstanding
//! requests. Waiter handles cannot leave the process: they stay in a local
//! map keyed by the same correlation id.
//!
//! ## Resolution Protocol
//!
//! Removing the local waiter picks the winning path (reply, expiry,
//! failure); the store's `take` then decides what the winner delivers. A
//! reply only fulfils the waiter if its store entry is still live, so a
//! reply never lands after the store has let the entry expire.
//!
//! ## Expiry
//!
//! Entries are written with TTL `timeout + grace`. The sweeper calls
//! `purge_expired` on the store and fails local waiters whose entries were
//! purged; overdue entries still in the store are expired through `take`.

use crate::domain::error::{CallError, PendingError};
use crate::domain::pending::{
    Outcome, PendingInfo, PendingStats, PendingTable, Resolved, Waiter,
};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_types::CorrelationId;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Key prefix for pending entries in the shared store.
pub const KEY_PREFIX: &str = "pending:";

/// Minimal key-value store with per-entry expiry.
pub trait SharedStore: Send + Sync {
    /// Store `value` under `key` unless a live entry exists. Returns whether
    /// the value was written.
    fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, PendingError>;

    /// Atomically remove and return a live entry.
    fn take(&self, key: &str) -> Result<Option<Vec<u8>>, PendingError>;

    /// Remove an entry. Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> Result<bool, PendingError>;

    /// Drop every expired entry and return their keys.
    fn purge_expired(&self) -> Result<Vec<String>, PendingError>;

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process [`SharedStore`] for single-host deployments and tests.
///
/// Expired entries are invisible to reads immediately and reclaimed by
/// `purge_expired`.
#[derive(Default)]
pub struct InMemorySharedStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl InMemorySharedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedStore for InMemorySharedStore {
    fn put_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, PendingError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|v| v.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn take(&self, key: &str) -> Result<Option<Vec<u8>>, PendingError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(entries
            .remove(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value))
    }

    fn delete(&self, key: &str) -> Result<bool, PendingError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|v| v.is_live(now)))
    }

    fn purge_expired(&self) -> Result<Vec<String>, PendingError> {
        let now = Instant::now();
        let mut purged = Vec::new();
        self.entries.lock().retain(|key, v| {
            if v.is_live(now) {
                true
            } else {
                purged.push(key.clone());
                false
            }
        });
        Ok(purged)
    }

    fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|v| v.is_live(now))
            .count()
    }
}

/// Metadata stored for each pending entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Wall-clock submission time (ms since Unix epoch)
    pub submitted_at_ms: i64,
    /// Wall-clock deadline (ms since Unix epoch)
    pub deadline_ms: i64,
    /// Identity of the gateway instance holding the waiter
    pub owner: String,
}

impl EntryMetadata {
    fn encode(&self) -> Result<Vec<u8>, PendingError> {
        serde_json::to_vec(self).map_err(|e| PendingError::Metadata(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PendingError> {
        serde_json::from_slice(bytes).map_err(|e| PendingError::Metadata(e.to_string()))
    }
}

/// Process-local half of a shared entry.
struct LocalWaiter {
    sender: oneshot::Sender<Outcome>,
    submitted_at: Instant,
    deadline: Instant,
    timeout: Duration,
}

/// [`PendingTable`] backed by a [`SharedStore`].
pub struct SharedPendingTable {
    store: Arc<dyn SharedStore>,
    owner: String,
    grace: Duration,
    waiters: DashMap<CorrelationId, LocalWaiter>,
    stats: PendingStats,
}

impl SharedPendingTable {
    /// Create a table writing entries owned by `owner` into `store`.
    pub fn new(store: Arc<dyn SharedStore>, owner: impl Into<String>, grace: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            grace,
            waiters: DashMap::new(),
            stats: PendingStats::default(),
        }
    }

    /// Owner identity written into entry metadata.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn key(id: &CorrelationId) -> String {
        format!("{}{}", KEY_PREFIX, id)
    }

    /// Remove the local waiter, take its store entry, then settle the waiter.
    ///
    /// Whoever removes the waiter settles it, so a waiter never outlives
    /// its map entry. If the store entry already lapsed the waiter times
    /// out; if the store fails it gets a backend error. `None` when another
    /// path removed the waiter first.
    fn settle(
        &self,
        id: &CorrelationId,
        outcome: impl FnOnce(&LocalWaiter) -> Outcome,
    ) -> Option<Settled> {
        let (_, waiter) = self.waiters.remove(id)?;

        let (settled, outcome) = match self.store.take(&Self::key(id)) {
            Ok(Some(bytes)) => {
                self.check_owner(id, &bytes);
                (Settled::Delivered, outcome(&waiter))
            }
            Ok(None) => {
                debug!(correlation_id = %id, "Store entry lapsed before settlement");
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                (
                    Settled::Lapsed,
                    Err(CallError::Timeout {
                        after: waiter.timeout,
                    }),
                )
            }
            Err(e) => {
                warn!(correlation_id = %id, error = %e, "Shared store take failed");
                self.stats.total_failed.fetch_add(1, Ordering::Relaxed);
                (Settled::StoreFailed, Err(CallError::Backend(e.to_string())))
            }
        };

        if waiter.sender.send(outcome).is_err() {
            debug!(correlation_id = %id, "Pending request receiver dropped");
        }
        Some(settled)
    }

    fn check_owner(&self, id: &CorrelationId, raw: &[u8]) {
        if let Ok(meta) = EntryMetadata::decode(raw) {
            if meta.owner != self.owner {
                // Reply affinity should make this impossible
                warn!(
                    correlation_id = %id,
                    owner = %meta.owner,
                    "Took an entry owned by another gateway instance"
                );
            }
        }
    }
}

/// How [`SharedPendingTable::settle`] ended a waiter.
enum Settled {
    /// The requested outcome was delivered.
    Delivered,
    /// The store entry had expired; the waiter got `Timeout`.
    Lapsed,
    /// The store failed; the waiter got `Backend`.
    StoreFailed,
}

impl PendingTable for SharedPendingTable {
    fn insert(&self, id: CorrelationId, timeout: Duration) -> Result<Waiter, PendingError> {
        if self.waiters.contains_key(&id) {
            return Err(PendingError::Duplicate);
        }

        let now_ms = Utc::now().timestamp_millis();
        let meta = EntryMetadata {
            submitted_at_ms: now_ms,
            deadline_ms: now_ms + timeout.as_millis() as i64,
            owner: self.owner.clone(),
        };

        if !self
            .store
            .put_if_absent(&Self::key(&id), meta.encode()?, timeout + self.grace)?
        {
            return Err(PendingError::Duplicate);
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.waiters.insert(
            id,
            LocalWaiter {
                sender: tx,
                submitted_at: now,
                deadline: now + timeout,
                timeout,
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        debug!(
            correlation_id = %id,
            owner = %self.owner,
            timeout_ms = timeout.as_millis() as u64,
            "Registered shared pending request"
        );
        Ok(rx)
    }

    fn try_resolve(&self, id: &CorrelationId, payload: Bytes) -> bool {
        let settled = self.settle(id, |w| {
            Ok(Resolved {
                payload,
                latency: w.submitted_at.elapsed(),
            })
        });
        let resolved = matches!(settled, Some(Settled::Delivered));
        if resolved {
            self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
        }
        resolved
    }

    fn try_expire(&self, id: &CorrelationId) -> bool {
        match self.settle(id, |w| Err(CallError::Timeout { after: w.timeout })) {
            Some(Settled::Delivered) => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(Settled::Lapsed | Settled::StoreFailed) => true,
            None => false,
        }
    }

    fn try_fail(&self, id: &CorrelationId, error: CallError) -> bool {
        match self.settle(id, |_| Err(error)) {
            Some(Settled::Delivered) => {
                self.stats.total_failed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(Settled::Lapsed | Settled::StoreFailed) => true,
            None => false,
        }
    }

    fn remove(&self, id: &CorrelationId) -> bool {
        if self.waiters.remove(id).is_none() {
            return false;
        }
        if let Err(e) = self.store.delete(&Self::key(id)) {
            warn!(correlation_id = %id, error = %e, "Shared store delete failed");
        }
        self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn fail_all(&self, error: CallError) -> usize {
        let ids: Vec<CorrelationId> = self.waiters.iter().map(|e| *e.key()).collect();
        let failed = ids
            .iter()
            .filter(|id| self.try_fail(id, error.clone()))
            .count();
        if failed > 0 {
            warn!(failed = failed, error = %error, "Failed all shared pending requests");
        }
        failed
    }

    fn expire_overdue(&self) -> usize {
        let mut expired = 0;

        // Entries the store already dropped can no longer be taken.
        match self.store.purge_expired() {
            Ok(keys) => {
                for key in keys {
                    let Some(id) = key
                        .strip_prefix(KEY_PREFIX)
                        .and_then(|s| CorrelationId::parse(s).ok())
                    else {
                        continue;
                    };
                    if let Some((_, waiter)) = self.waiters.remove(&id) {
                        let _ = waiter.sender.send(Err(CallError::Timeout {
                            after: waiter.timeout,
                        }));
                        self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                        expired += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Shared store purge failed"),
        }

        let now = Instant::now();
        let overdue: Vec<CorrelationId> = self
            .waiters
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| *e.key())
            .collect();
        expired += overdue.iter().filter(|id| self.try_expire(id)).count();

        if expired > 0 {
            debug!(expired = expired, "Expired overdue shared pending requests");
        }
        expired
    }

    fn len(&self) -> usize {
        self.waiters.len()
    }

    fn contains(&self, id: &CorrelationId) -> bool {
        self.waiters.contains_key(id)
    }

    fn entries(&self) -> Vec<PendingInfo> {
        let now = Instant::now();
        self.waiters
            .iter()
            .map(|e| PendingInfo {
                correlation_id: *e.key(),
                age_ms: now.saturating_duration_since(e.value().submitted_at).as_millis() as u64,
                remaining_ms: e.value().deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }

    fn stats(&self) -> &PendingStats {
        &self.stats
    }
}
