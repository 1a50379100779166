//! Lifecycle worker
//!
//! All event-driven adapter work (connectivity changes, preference
//! changes, host commands) is queued onto one bounded channel and served
//! by a single task, so blocking adapter construction never runs on the
//! thread that delivered the event and lifecycle jobs never overlap.

use crate::config::{ConfigKey, TunnelConfig};
use crate::controller::Core;
use crate::events::NetworkId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands the host service sends to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    /// Remember `config` and bring the tunnel up once the network allows
    Start(TunnelConfig),
    /// Tear the tunnel down
    Stop,
    /// Rebuild the tunnel with `config`
    Restart(TunnelConfig),
}

/// Jobs served by the lifecycle worker
#[derive(Debug)]
pub(crate) enum LifecycleCommand {
    NetworkConnected(Option<NetworkId>),
    /// Carries the connectivity epoch the loss was observed at
    NetworkDisconnected(u64),
    ConfigChanged(ConfigKey, TunnelConfig),
    ApplyConfig(TunnelConfig),
    Service(ServiceCommand),
    /// Reply once every job queued before it has run
    Flush(oneshot::Sender<()>),
    Shutdown,
}

impl LifecycleCommand {
    fn name(&self) -> &'static str {
        match self {
            LifecycleCommand::NetworkConnected(_) => "network-connected",
            LifecycleCommand::NetworkDisconnected(_) => "network-disconnected",
            LifecycleCommand::ConfigChanged(..) => "config-changed",
            LifecycleCommand::ApplyConfig(_) => "apply-config",
            LifecycleCommand::Service(_) => "service-command",
            LifecycleCommand::Flush(_) => "flush",
            LifecycleCommand::Shutdown => "shutdown",
        }
    }
}

/// Spawn the lifecycle worker task.
pub(crate) fn spawn_worker(
    core: Arc<Core>,
    capacity: usize,
) -> (mpsc::Sender<LifecycleCommand>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        info!("Lifecycle worker started");
        run_worker_loop(&core, rx).await;
        // Whatever ended the loop, no adapter outlives the worker
        core.stop().await;
        info!("Lifecycle worker stopped");
    });
    (tx, handle)
}

/// Main worker loop.
async fn run_worker_loop(core: &Core, mut rx: mpsc::Receiver<LifecycleCommand>) {
    while let Some(command) = rx.recv().await {
        debug!("Lifecycle job: {}", command.name());

        match command {
            LifecycleCommand::NetworkConnected(network) => {
                core.network_available(network).await;
            }
            LifecycleCommand::NetworkDisconnected(epoch) => {
                core.network_lost(epoch).await;
            }
            LifecycleCommand::ConfigChanged(key, config) => {
                if let Err(e) = core.on_config_changed(key, config).await {
                    warn!("Config change ({}) not applied: {}", key, e);
                }
            }
            LifecycleCommand::ApplyConfig(config) => {
                if let Err(e) = core.apply_config(config).await {
                    warn!("Config update not applied: {}", e);
                }
            }
            LifecycleCommand::Service(ServiceCommand::Start(config)) => {
                core.start_when_connected(config).await;
            }
            LifecycleCommand::Service(ServiceCommand::Stop) => {
                core.stop().await;
            }
            LifecycleCommand::Service(ServiceCommand::Restart(config)) => {
                if let Err(e) = core.restart(config).await {
                    warn!("Restart command failed: {}", e);
                }
            }
            LifecycleCommand::Flush(reply) => {
                let _ = reply.send(());
            }
            LifecycleCommand::Shutdown => {
                debug!("Lifecycle worker received shutdown");
                break;
            }
        }
    }
}

/// Errors enqueueing lifecycle work
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Lifecycle queue is full")]
    QueueFull,

    #[error("Lifecycle worker has stopped")]
    Gone,
}

impl<T> From<mpsc::error::TrySendError<T>> for WorkerError {
    fn from(e: mpsc::error::TrySendError<T>) -> Self {
        match e {
            mpsc::error::TrySendError::Full(_) => WorkerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WorkerError::Gone,
        }
    }
}

impl<T> From<mpsc::error::SendError<T>> for WorkerError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        WorkerError::Gone
    }
}
