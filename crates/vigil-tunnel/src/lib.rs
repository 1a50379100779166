//! Vigil Tunnel - Adapter lifecycle for an on-device DNS/firewall tunnel
//!
//! Owns the single live tunnel adapter: starts it when the host asks and
//! the network allows, rebuilds it when settings change, and derives a
//! connection health signal from recent DNS transactions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Host Service                          │
//! │                                                              │
//! │  connectivity ─┐                                             │
//! │  settings ─────┼──▶ lifecycle queue ──▶ worker ──┐           │
//! │  commands ─────┘     (bounded mpsc)              │           │
//! │                                                  ▼           │
//! │  transactions ──▶ tracker ──▶ ┌──────────────────────────┐   │
//! │                               │     TunnelController     │   │
//! │                               │  slot: Stopped | Running │   │
//! │                               └────────────┬─────────────┘   │
//! │                                            │                 │
//! │               observers ◀── snapshot ──────┤                 │
//! │                                            ▼                 │
//! │                               ┌──────────────────────────┐   │
//! │                               │  AdapterFactory/Adapter  │   │
//! │                               └──────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Single adapter**: at most one adapter is installed at any instant
//! - **Seamless restart**: the replacement is built before the old one closes
//! - **Connectivity gating**: health never moves while the network is down
//! - **Non-blocking callbacks**: event sources only enqueue work

mod adapter;
mod blocklist;
mod config;
mod controller;
mod events;
mod observer;
mod settings;
mod state;
mod tracker;
mod transaction;
mod worker;

#[cfg(test)]
mod testing;

pub use adapter::{Adapter, AdapterError, AdapterFactory, BlocklistGate, FactoryError};
pub use blocklist::{
    delete_recursive, is_valid_timestamp, BlocklistStore, DEFAULT_BLOCKLIST_FILE_COUNT,
};
pub use config::{
    AppId, AppRouting, ConfigError, ConfigKey, DnsMode, FirewallMode, TunnelConfig,
    APP_STORE_PACKAGE,
};
pub use controller::{
    ConfigAction, ControllerOptions, RestartError, Restarted, StartError, Started,
    StateInvariantViolation, TunnelController,
};
pub use events::{Connectivity, ListenerHandle, NetworkId};
pub use observer::{ChannelObserver, ObserverEvent, ObserverRegistry, StateObserver, Subscription};
pub use settings::{ServiceSettings, SettingsError};
pub use state::{ConnectionState, StateSnapshot};
pub use tracker::{ConnectionTracker, TrackerStats, TrackingError, DEFAULT_TRACKER_CAPACITY};
pub use transaction::{Transaction, TransactionStatus};
pub use worker::{ServiceCommand, WorkerError};
