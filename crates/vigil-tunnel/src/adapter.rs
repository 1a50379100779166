//! Adapter Capabilities
//!
//! The adapter is the live tunnel session: packet forwarding and DNS
//! resolution happen inside it and are opaque to this crate. The
//! controller only ever builds one through an [`AdapterFactory`], starts
//! it, pushes configuration to it and closes it.

use crate::blocklist::BlocklistStore;
use crate::config::{DnsMode, FirewallMode, TunnelConfig};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// A running tunnel instance
///
/// Implementations must tolerate `close` being called exactly once after
/// any combination of `start` and `update_config` calls.
pub trait Adapter: Send + 'static {
    /// Enable forwarding with the given modes
    fn start(&mut self, dns_mode: DnsMode, firewall_mode: FirewallMode) -> Result<(), AdapterError>;

    /// Push a resolver-only update without rebuilding the tunnel
    fn update_config(&mut self, config: &TunnelConfig) -> Result<(), AdapterError>;

    /// Tear the tunnel down and release its resources
    fn close(&mut self);
}

/// Builds adapters from configuration snapshots
///
/// `create` may be called while a previous adapter is still serving
/// traffic, so implementations must not assume exclusive access to
/// platform tunnel resources.
#[async_trait]
pub trait AdapterFactory: Send + Sync + 'static {
    async fn create(&self, config: &TunnelConfig) -> Result<Box<dyn Adapter>, FactoryError>;
}

/// Factory wrapper that refuses to build adapters whose local blocklist
/// has not finished downloading
pub struct BlocklistGate<F> {
    inner: F,
    store: BlocklistStore,
}

impl<F: AdapterFactory> BlocklistGate<F> {
    pub fn new(inner: F, store: BlocklistStore) -> Self {
        Self { inner, store }
    }

    pub fn store(&self) -> &BlocklistStore {
        &self.store
    }
}

#[async_trait]
impl<F: AdapterFactory> AdapterFactory for BlocklistGate<F> {
    async fn create(&self, config: &TunnelConfig) -> Result<Box<dyn Adapter>, FactoryError> {
        if let Some(timestamp) = &config.local_blocklist {
            if !self.store.check_download(timestamp).await {
                warn!("Local blocklist {} is incomplete, refusing to build adapter", timestamp);
                return Err(FactoryError::BlocklistUnavailable(timestamp.clone()));
            }
            debug!("Local blocklist {} verified", timestamp);
        }
        self.inner.create(config).await
    }
}

/// Errors raised by a live adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("Adapter already closed")]
    Closed,

    #[error("Forwarding failed to start: {0}")]
    StartFailed(String),

    #[error("Configuration update rejected: {0}")]
    UpdateRejected(String),
}

/// Adapter construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactoryError {
    #[error("Tunnel establishment failed: {0}")]
    Establish(String),

    #[error("Platform resources exhausted")]
    ResourceExhausted,

    #[error("Local blocklist {0} is not downloaded")]
    BlocklistUnavailable(String),

    #[error("Adapter construction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Adapter failed to start: {0}")]
    Start(#[from] AdapterError),
}
