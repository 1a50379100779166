//! Host event sources
//!
//! Hosts either call the controller's callbacks directly or hand it a
//! `tokio::sync::watch` receiver and let a listener task forward every
//! change onto the lifecycle queue.

use crate::config::TunnelConfig;
use crate::controller::TunnelController;
use crate::worker::LifecycleCommand;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Identity of the physical network the tunnel is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connectivity as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// Online, optionally on a known network
    Connected(Option<NetworkId>),
    #[default]
    Disconnected,
}

impl Connectivity {
    pub fn is_connected(&self) -> bool {
        matches!(self, Connectivity::Connected(_))
    }
}

/// Handle to a listener task started by an `attach_*` call
///
/// Dropping the handle stops the listener. Listeners also end on
/// [`TunnelController::shutdown`] or when the sending side of their
/// channel is dropped.
#[must_use = "dropping the handle stops the listener"]
pub struct ListenerHandle {
    handle: AbortHandle,
}

impl ListenerHandle {
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TunnelController {
    /// Follow a configuration snapshot channel
    ///
    /// The current value is applied immediately, then every update is
    /// diffed against the cached configuration on the lifecycle worker.
    pub fn attach_config_source(&self, mut source: watch::Receiver<TunnelConfig>) -> ListenerHandle {
        let controller = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let config = source.borrow_and_update().clone();
                if let Err(e) = controller.submit_wait(LifecycleCommand::ApplyConfig(config)).await {
                    warn!("Config listener stopping: {}", e);
                    return;
                }
                if source.changed().await.is_err() {
                    debug!("Config source closed");
                    return;
                }
            }
        });
        self.listen(task)
    }

    /// Follow a connectivity channel
    pub fn attach_connectivity_source(&self, mut source: watch::Receiver<Connectivity>) -> ListenerHandle {
        let controller = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let connectivity = source.borrow_and_update().clone();
                let command = controller.note_connectivity(connectivity);
                if let Err(e) = controller.submit_wait(command).await {
                    warn!("Connectivity listener stopping: {}", e);
                    return;
                }
                if source.changed().await.is_err() {
                    debug!("Connectivity source closed");
                    return;
                }
            }
        });
        self.listen(task)
    }

    fn listen(&self, task: tokio::task::JoinHandle<()>) -> ListenerHandle {
        let handle = task.abort_handle();
        self.track_listener(handle.clone());
        ListenerHandle { handle }
    }
}
