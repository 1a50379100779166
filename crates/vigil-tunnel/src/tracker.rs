//! Connection Tracker
//!
//! Keeps the most recent finalized transactions and derives connection
//! health from them. Retention is capped; once full, the oldest record
//! is evicted for each new one.

use crate::state::ConnectionState;
use crate::transaction::{Transaction, TransactionStatus};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Default number of transactions kept
pub const DEFAULT_TRACKER_CAPACITY: usize = 1024;

/// Counters over everything ever recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub complete: u64,
    pub failed: u64,
    pub canceled: u64,
    /// Records dropped to honor the capacity
    pub evicted: u64,
}

impl TrackerStats {
    pub fn total(&self) -> u64 {
        self.complete + self.failed + self.canceled
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "OK: {} | Failed: {} | Canceled: {} | Evicted: {}",
            self.complete, self.failed, self.canceled, self.evicted
        )
    }
}

struct TrackerInner {
    records: VecDeque<Transaction>,
    stats: TrackerStats,
    health: ConnectionState,
}

/// Thread-safe, append-only transaction log
pub struct ConnectionTracker {
    inner: Mutex<TrackerInner>,
    capacity: usize,
}

impl ConnectionTracker {
    /// Create a tracker keeping at most `capacity` transactions
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(TrackerInner {
                records: VecDeque::with_capacity(capacity.min(DEFAULT_TRACKER_CAPACITY)),
                stats: TrackerStats::default(),
                health: ConnectionState::New,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a finalized transaction
    pub fn record(&self, transaction: Transaction) -> Result<(), TrackingError> {
        let status = transaction.status;
        if !status.is_final() {
            return Err(TrackingError::NotFinalized(transaction.name));
        }

        let mut inner = self.inner.lock().map_err(|_| TrackingError::Poisoned)?;

        match status {
            TransactionStatus::Complete => inner.stats.complete += 1,
            TransactionStatus::Failed => inner.stats.failed += 1,
            TransactionStatus::Canceled => inner.stats.canceled += 1,
            TransactionStatus::Pending => {}
        }
        inner.health = inner.health.after(status);

        if inner.records.len() == self.capacity {
            inner.records.pop_front();
            inner.stats.evicted += 1;
        }
        debug!("Recorded transaction {} ({:?})", transaction.name, status);
        inner.records.push_back(transaction);
        Ok(())
    }

    /// Health derived from the most recent informative record
    pub fn current_health(&self) -> ConnectionState {
        self.inner
            .lock()
            .map(|inner| inner.health)
            .unwrap_or_default()
    }

    /// Up to `n` most recent transactions, newest last
    pub fn recent(&self, n: usize) -> Vec<Transaction> {
        match self.inner.lock() {
            Ok(inner) => {
                let skip = inner.records.len().saturating_sub(n);
                inner.records.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TrackerStats {
        self.inner.lock().map(|inner| inner.stats).unwrap_or_default()
    }

    /// Drop retained records and reset health; counters are kept
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.records.clear();
            inner.health = ConnectionState::New;
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKER_CAPACITY)
    }
}

/// Failures to record a transaction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackingError {
    #[error("Transaction {0} is still pending")]
    NotFinalized(String),

    #[error("Tracker state poisoned by a panicked writer")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionStatus::*;

    fn tx(name: &str, status: TransactionStatus) -> Transaction {
        Transaction::completed(name, status)
    }

    #[test]
    fn test_health_follows_last_informative() {
        let tracker = ConnectionTracker::default();
        assert_eq!(tracker.current_health(), ConnectionState::New);

        tracker.record(tx("a", Canceled)).unwrap();
        assert_eq!(tracker.current_health(), ConnectionState::New);

        tracker.record(tx("b", Complete)).unwrap();
        tracker.record(tx("c", Failed)).unwrap();
        tracker.record(tx("d", Canceled)).unwrap();
        assert_eq!(tracker.current_health(), ConnectionState::Failing);

        tracker.record(tx("e", Complete)).unwrap();
        assert_eq!(tracker.current_health(), ConnectionState::Working);
    }

    #[test]
    fn test_rejects_pending() {
        let tracker = ConnectionTracker::default();
        let result = tracker.record(Transaction::begin("pending.example"));

        assert_eq!(result, Err(TrackingError::NotFinalized("pending.example".into())));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let tracker = ConnectionTracker::new(3);
        for i in 0..5 {
            tracker.record(tx(&format!("q{}", i), Complete)).unwrap();
        }

        assert_eq!(tracker.len(), 3);
        let names: Vec<_> = tracker.recent(10).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["q2", "q3", "q4"]);

        let stats = tracker.stats();
        assert_eq!(stats.complete, 5);
        assert_eq!(stats.evicted, 2);
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn test_recent_and_clear() {
        let tracker = ConnectionTracker::default();
        tracker.record(tx("a", Complete)).unwrap();
        tracker.record(tx("b", Failed)).unwrap();

        let recent = tracker.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].name, "b");

        tracker.clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.current_health(), ConnectionState::New);
        assert_eq!(tracker.stats().failed, 1);
    }

    #[test]
    fn test_concurrent_record() {
        let tracker = std::sync::Arc::new(ConnectionTracker::new(10_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        tracker.record(tx(&format!("{}-{}", t, i), Complete)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.len(), 400);
    }
}
