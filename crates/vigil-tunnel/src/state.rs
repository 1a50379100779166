//! Controller state
//!
//! Adapter presence and connection health are a single tagged value:
//! health only exists while an adapter is installed, so "health set but
//! no adapter" cannot be represented.

use crate::adapter::Adapter;
use crate::transaction::TransactionStatus;

/// Aggregate connection health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No verdict yet, or the network is down
    #[default]
    New,
    /// The last informative transaction succeeded
    Working,
    /// The last informative transaction failed
    Failing,
}

impl ConnectionState {
    /// State after observing a transaction with `status`
    pub fn after(self, status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Complete => ConnectionState::Working,
            TransactionStatus::Failed => ConnectionState::Failing,
            TransactionStatus::Canceled | TransactionStatus::Pending => self,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Working => "working",
            ConnectionState::Failing => "failing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What observers are told after every state mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Is an adapter installed?
    pub adapter_present: bool,
    /// Health, present only while an adapter is installed
    pub connection: Option<ConnectionState>,
}

impl StateSnapshot {
    pub fn stopped() -> Self {
        Self {
            adapter_present: false,
            connection: None,
        }
    }

    pub fn running(health: ConnectionState) -> Self {
        Self {
            adapter_present: true,
            connection: Some(health),
        }
    }
}

/// The single adapter slot owned by the controller
#[derive(Default)]
pub(crate) enum TunnelSlot {
    #[default]
    Stopped,
    Running {
        adapter: Box<dyn Adapter>,
        health: ConnectionState,
    },
}

impl TunnelSlot {
    pub(crate) fn is_running(&self) -> bool {
        matches!(self, TunnelSlot::Running { .. })
    }

    /// Health as seen from outside: NEW while stopped
    pub(crate) fn health(&self) -> ConnectionState {
        match self {
            TunnelSlot::Stopped => ConnectionState::New,
            TunnelSlot::Running { health, .. } => *health,
        }
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        match self {
            TunnelSlot::Stopped => StateSnapshot::stopped(),
            TunnelSlot::Running { health, .. } => StateSnapshot::running(*health),
        }
    }

    pub(crate) fn adapter_mut(&mut self) -> Option<&mut Box<dyn Adapter>> {
        match self {
            TunnelSlot::Stopped => None,
            TunnelSlot::Running { adapter, .. } => Some(adapter),
        }
    }

    /// Install `adapter` into an empty slot with fresh health
    ///
    /// Hands the adapter back if the slot is occupied.
    pub(crate) fn install(&mut self, adapter: Box<dyn Adapter>) -> Result<(), Box<dyn Adapter>> {
        if self.is_running() {
            return Err(adapter);
        }
        *self = TunnelSlot::Running {
            adapter,
            health: ConnectionState::New,
        };
        Ok(())
    }

    /// Swap in `adapter`, returning the one it replaces
    pub(crate) fn replace(&mut self, adapter: Box<dyn Adapter>) -> Option<Box<dyn Adapter>> {
        let previous = self.take();
        *self = TunnelSlot::Running {
            adapter,
            health: ConnectionState::New,
        };
        previous
    }

    /// Empty the slot
    pub(crate) fn take(&mut self) -> Option<Box<dyn Adapter>> {
        match std::mem::take(self) {
            TunnelSlot::Stopped => None,
            TunnelSlot::Running { adapter, .. } => Some(adapter),
        }
    }

    /// Set health; returns true when it changed. No-op while stopped.
    pub(crate) fn set_health(&mut self, next: ConnectionState) -> bool {
        match self {
            TunnelSlot::Stopped => false,
            TunnelSlot::Running { health, .. } => {
                let changed = *health != next;
                *health = next;
                changed
            }
        }
    }
}
