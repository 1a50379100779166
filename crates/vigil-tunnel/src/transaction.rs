//! Resolution transactions observed through the tunnel.

use std::time::{Duration, Instant};

/// Outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Still in flight
    Pending,
    /// Answered by the upstream resolver
    Complete,
    /// Upstream failed or timed out
    Failed,
    /// Abandoned by the client; carries no health information
    Canceled,
}

impl TransactionStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// A single query resolved through the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Queried name
    pub name: String,
    /// Current status
    pub status: TransactionStatus,
    /// When the query entered the tunnel
    pub start_time: Instant,
    /// When the query was finalized
    pub response_time: Option<Instant>,
}

impl Transaction {
    /// Begin a pending transaction
    pub fn begin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TransactionStatus::Pending,
            start_time: Instant::now(),
            response_time: None,
        }
    }

    /// Finalize with `status`, stamping the response time
    ///
    /// Already-final transactions are returned unchanged.
    pub fn finish(mut self, status: TransactionStatus) -> Self {
        if self.status.is_final() {
            return self;
        }
        self.status = status;
        if status.is_final() {
            self.response_time = Some(Instant::now());
        }
        self
    }

    /// Shorthand for `begin(name).finish(status)`
    pub fn completed(name: impl Into<String>, status: TransactionStatus) -> Self {
        Self::begin(name).finish(status)
    }

    /// Time between start and response
    pub fn latency(&self) -> Option<Duration> {
        self.response_time
            .map(|t| t.saturating_duration_since(self.start_time))
    }
}
