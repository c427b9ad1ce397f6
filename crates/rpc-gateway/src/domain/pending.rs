//! Pending-request table: the async-to-sync bridge.
//!
//! Maps correlation ids to waiting callers. Every operation that ends an
//! entry's life (`try_resolve`, `try_expire`, `try_fail`, `remove`) removes
//! the entry and settles its waiter in one step, so whichever path removes
//! the entry first is the only one that resolves it.

use crate::domain::error::{CallError, PendingError};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use shared_types::CorrelationId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A reply matched to its pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub payload: Bytes,
    /// Time from registration to resolution
    pub latency: Duration,
}

/// Final outcome delivered to a waiter.
pub type Outcome = Result<Resolved, CallError>;

/// Receiving half of a pending entry, held by the submitting caller.
pub type Waiter = oneshot::Receiver<Outcome>;

/// Diagnostic view of one pending entry.
#[derive(Debug, Clone, Serialize)]
pub struct PendingInfo {
    pub correlation_id: CorrelationId,
    pub age_ms: u64,
    pub remaining_ms: u64,
}

/// Statistics for a pending table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total entries inserted
    pub total_registered: AtomicU64,
    /// Total entries resolved by a reply
    pub total_completed: AtomicU64,
    /// Total entries expired
    pub total_timeouts: AtomicU64,
    /// Total entries failed by infrastructure (disconnect, shutdown)
    pub total_failed: AtomicU64,
    /// Total entries removed without resolution (caller went away, publish failed)
    pub total_cancelled: AtomicU64,
}

impl PendingStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "registered": self.total_registered.load(Ordering::Relaxed),
            "completed": self.total_completed.load(Ordering::Relaxed),
            "timeouts": self.total_timeouts.load(Ordering::Relaxed),
            "failed": self.total_failed.load(Ordering::Relaxed),
            "cancelled": self.total_cancelled.load(Ordering::Relaxed),
        })
    }
}

/// Pluggable pending-state backend.
///
/// Implementations must make each removal-with-resolution atomic per entry:
/// for any id, at most one of `try_resolve`, `try_expire`, `try_fail`,
/// `remove` (or the bulk variants) returns `true`.
pub trait PendingTable: Send + Sync {
    /// Register a new entry that expires `timeout` from now.
    fn insert(&self, id: CorrelationId, timeout: Duration) -> Result<Waiter, PendingError>;

    /// Fulfil the entry with a reply payload.
    fn try_resolve(&self, id: &CorrelationId, payload: Bytes) -> bool;

    /// Fail the entry with `Timeout`.
    fn try_expire(&self, id: &CorrelationId) -> bool;

    /// Fail the entry with an infrastructure error.
    fn try_fail(&self, id: &CorrelationId, error: CallError) -> bool;

    /// Drop the entry without settling its waiter.
    fn remove(&self, id: &CorrelationId) -> bool;

    /// Fail every entry with `error`. Returns how many were failed.
    fn fail_all(&self, error: CallError) -> usize;

    /// Expire every entry whose deadline has passed. Returns how many.
    fn expire_overdue(&self) -> usize;

    /// Number of entries currently pending.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is currently pending.
    fn contains(&self, id: &CorrelationId) -> bool;

    /// Diagnostic listing of pending entries.
    fn entries(&self) -> Vec<PendingInfo>;

    /// Table statistics.
    fn stats(&self) -> &PendingStats;
}

/// A pending request waiting for its reply
struct PendingRequest {
    /// Channel to send the outcome
    sender: oneshot::Sender<Outcome>,
    /// When the request was registered
    submitted_at: Instant,
    /// When the request expires
    deadline: Instant,
    /// Timeout the request was registered with
    timeout: Duration,
}

impl PendingRequest {
    fn info(&self, id: CorrelationId, now: Instant) -> PendingInfo {
        PendingInfo {
            correlation_id: id,
            age_ms: now.saturating_duration_since(self.submitted_at).as_millis() as u64,
            remaining_ms: self.deadline.saturating_duration_since(now).as_millis() as u64,
        }
    }
}

/// In-process backend over a concurrent map.
///
/// Flow:
/// 1. Correlator generates a CorrelationId
/// 2. Correlator calls `insert()` to get a waiter
/// 3. Correlator publishes the request tagged with the id
/// 4. Reply listener calls `try_resolve()`
/// 5. Correlator awaits the waiter or calls `try_expire()` at the deadline
pub struct LocalPendingTable {
    /// Map of correlation ID to pending request
    pending: DashMap<CorrelationId, PendingRequest>,
    /// Statistics
    stats: PendingStats,
}

impl LocalPendingTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            stats: PendingStats::default(),
        }
    }

    fn settle(
        &self,
        id: &CorrelationId,
        outcome: impl FnOnce(&PendingRequest) -> Outcome,
    ) -> bool {
        let Some((_, request)) = self.pending.remove(id) else {
            return false;
        };

        // The caller may already be gone; the entry is removed either way.
        let outcome = outcome(&request);
        if request.sender.send(outcome).is_err() {
            debug!(correlation_id = %id, "Pending request receiver dropped");
        }
        true
    }
}

impl Default for LocalPendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable for LocalPendingTable {
    fn insert(&self, id: CorrelationId, timeout: Duration) -> Result<Waiter, PendingError> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        match self.pending.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PendingError::Duplicate),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    sender: tx,
                    submitted_at: now,
                    deadline: now + timeout,
                    timeout,
                });
                self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Registered pending request"
                );
                Ok(rx)
            }
        }
    }

    fn try_resolve(&self, id: &CorrelationId, payload: Bytes) -> bool {
        let resolved = self.settle(id, |request| {
            Ok(Resolved {
                payload,
                latency: request.submitted_at.elapsed(),
            })
        });
        if resolved {
            self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
        }
        resolved
    }

    fn try_expire(&self, id: &CorrelationId) -> bool {
        let expired = self.settle(id, |request| {
            Err(CallError::Timeout {
                after: request.timeout,
            })
        });
        if expired {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
        }
        expired
    }

    fn try_fail(&self, id: &CorrelationId, error: CallError) -> bool {
        let failed = self.settle(id, |_| Err(error));
        if failed {
            self.stats.total_failed.fetch_add(1, Ordering::Relaxed);
        }
        failed
    }

    fn remove(&self, id: &CorrelationId) -> bool {
        if self.pending.remove(id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn fail_all(&self, error: CallError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let failed = ids
            .iter()
            .filter(|id| self.try_fail(id, error.clone()))
            .count();
        if failed > 0 {
            warn!(failed = failed, error = %error, "Failed all pending requests");
        }
        failed
    }

    fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| *e.key())
            .collect();

        let expired = overdue.iter().filter(|id| self.try_expire(id)).count();
        if expired > 0 {
            debug!(expired = expired, "Expired overdue pending requests");
        }
        expired
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    fn entries(&self) -> Vec<PendingInfo> {
        let now = Instant::now();
        self.pending
            .iter()
            .map(|e| e.value().info(*e.key(), now))
            .collect()
    }

    fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_insert_and_resolve() {
        let table = LocalPendingTable::new();
        let id = CorrelationId::new();

        let rx = table.insert(id, Duration::from_secs(30)).unwrap();
        assert!(table.contains(&id));
        assert_eq!(table.len(), 1);

        assert!(table.try_resolve(&id, Bytes::from_static(b"foo bar")));

        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved.payload, "foo bar");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let table = LocalPendingTable::new();
        let id = CorrelationId::new();

        let _rx = table.insert(id, Duration::from_secs(30)).unwrap();
        assert_eq!(
            table.insert(id, Duration::from_secs(30)).unwrap_err(),
            PendingError::Duplicate
        );
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let table = LocalPendingTable::new();
        assert!(!table.try_resolve(&CorrelationId::new(), Bytes::new()));
    }

    #[tokio::test]
    async fn test_expire_then_resolve_is_noop() {
        let table = LocalPendingTable::new();
        let id = CorrelationId::new();
        let rx = table.insert(id, Duration::from_millis(200)).unwrap();

        assert!(table.try_expire(&id));
        assert!(!table.try_resolve(&id, Bytes::from_static(b"late")));

        assert_eq!(
            rx.await.unwrap(),
            Err(CallError::Timeout {
                after: Duration::from_millis(200)
            })
        );
    }

    #[tokio::test]
    async fn test_resolve_then_expire_is_noop() {
        let table = LocalPendingTable::new();
        let id = CorrelationId::new();
        let rx = table.insert(id, Duration::from_millis(200)).unwrap();

        assert!(table.try_resolve(&id, Bytes::from_static(b"ok")));
        assert!(!table.try_expire(&id));
        assert_eq!(rx.await.unwrap().unwrap().payload, "ok");
    }

    #[tokio::test]
    async fn test_remove_leaves_waiter_closed() {
        let table = LocalPendingTable::new();
        let id = CorrelationId::new();
        let rx = table.insert(id, Duration::from_secs(30)).unwrap();

        assert!(table.remove(&id));
        assert!(!table.remove(&id));
        assert!(rx.await.is_err());
        assert_eq!(table.stats().total_cancelled.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = LocalPendingTable::new();
        let rx1 = table.insert(CorrelationId::new(), Duration::from_secs(30)).unwrap();
        let rx2 = table.insert(CorrelationId::new(), Duration::from_secs(30)).unwrap();

        assert_eq!(table.fail_all(CallError::BrokerDisconnected), 2);
        assert!(table.is_empty());
        assert_eq!(rx1.await.unwrap(), Err(CallError::BrokerDisconnected));
        assert_eq!(rx2.await.unwrap(), Err(CallError::BrokerDisconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue() {
        let table = LocalPendingTable::new();
        let short = CorrelationId::new();
        let long = CorrelationId::new();
        let _rx1 = table.insert(short, Duration::from_millis(10)).unwrap();
        let _rx2 = table.insert(long, Duration::from_secs(30)).unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;

        assert_eq!(table.expire_overdue(), 1);
        assert!(!table.contains(&short));
        assert!(table.contains(&long));
        assert_eq!(table.stats().total_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_measured_from_registration() {
        let table = LocalPendingTable::new();
        let id = CorrelationId::new();
        let rx = table.insert(id, Duration::from_secs(30)).unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(table.try_resolve(&id, Bytes::from_static(b"foo bar")));

        // Waking the caller later does not stretch the measured latency.
        tokio::time::advance(Duration::from_millis(500)).await;
        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved.latency, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_report_age() {
        let table = LocalPendingTable::new();
        let id = CorrelationId::new();
        let _rx = table.insert(id, Duration::from_secs(1)).unwrap();

        tokio::time::advance(Duration::from_millis(300)).await;

        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].correlation_id, id);
        assert_eq!(entries[0].age_ms, 300);
        assert_eq!(entries[0].remaining_ms, 700);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_resolve_and_expire_single_outcome() {
        let table = Arc::new(LocalPendingTable::new());

        for _ in 0..200 {
            let id = CorrelationId::new();
            let rx = table.insert(id, Duration::from_millis(1)).unwrap();

            let resolver = {
                let table = Arc::clone(&table);
                tokio::spawn(async move { table.try_resolve(&id, Bytes::from_static(b"r")) })
            };
            let expirer = {
                let table = Arc::clone(&table);
                tokio::spawn(async move { table.try_expire(&id) })
            };

            let resolved = resolver.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(resolved ^ expired, "exactly one path must win");

            let outcome = rx.await.unwrap();
            assert_eq!(outcome.is_ok(), resolved);
        }
        assert!(table.is_empty());
    }
}
