//! Tunnel Controller
//!
//! Owns the single adapter slot and serializes every mutation of it.
//!
//! # Locking
//!
//! One `tokio::sync::Mutex` guards the slot, the cached configuration and
//! the underlying network binding. Public operations take it for their
//! whole duration, including adapter construction, so at most one
//! lifecycle mutation is ever in flight and `stop` issued during a
//! `restart` simply waits and then tears down whichever adapter won.
//!
//! Connectivity and preference callbacks never take the lock on their
//! own thread. They flip the atomic connectivity flag and queue work for
//! the lifecycle worker (see [`crate::worker`]).
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = TunnelController::new(factory, ControllerOptions::default());
//! let _sub = controller.subscribe(Arc::new(ui_observer));
//!
//! controller.dispatch(ServiceCommand::Start(config))?;
//! controller.on_network_connected();          // worker builds the adapter
//!
//! controller.record_transaction(tx).await;    // health: NEW -> WORKING
//! controller.shutdown().await;
//! ```

use crate::adapter::{Adapter, AdapterFactory, FactoryError};
use crate::config::{ConfigError, ConfigKey, TunnelConfig};
use crate::events::{Connectivity, NetworkId};
use crate::observer::{ObserverRegistry, StateObserver, Subscription};
use crate::state::{ConnectionState, StateSnapshot, TunnelSlot};
use crate::tracker::{ConnectionTracker, DEFAULT_TRACKER_CAPACITY};
use crate::transaction::Transaction;
use crate::worker::{spawn_worker, LifecycleCommand, ServiceCommand, WorkerError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Upper bound on a single adapter construction
    pub factory_timeout: Duration,
    /// Lifecycle jobs that may wait before events are rejected
    pub queue_capacity: usize,
    /// Transactions kept by the tracker
    pub tracker_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            factory_timeout: Duration::from_secs(30),
            queue_capacity: 32,
            tracker_capacity: DEFAULT_TRACKER_CAPACITY,
        }
    }
}

/// Successful `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    /// A new adapter was built and installed
    Created,
    /// An adapter was already running; nothing changed
    AlreadyRunning,
}

/// Successful `restart`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restarted;

/// What a configuration change resulted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Snapshot identical to the cached one
    Unchanged,
    /// No adapter running; snapshot stored for the next start
    Cached,
    /// Adapter rebuilt
    Restarted,
    /// Resolver update pushed to the running adapter
    Updated,
}

/// Fatal `start` failures; the host should stop its service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Adapter construction failed: {0}")]
    Factory(#[from] FactoryError),
}

/// `restart` failures; the previous adapter stays installed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestartError {
    #[error("No adapter is running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Replacement adapter failed: {0}")]
    Factory(#[from] FactoryError),
}

/// Internal bookkeeping bugs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateInvariantViolation {
    #[error("Attempted to install an adapter while another is running")]
    DoubleInstall,
}

/// Fail fast in debug builds; log and carry on in release builds.
fn invariant_violated(violation: StateInvariantViolation) {
    error!("State invariant violated: {}", violation);
    debug_assert!(false, "{}", violation);
}

/// State guarded by the controller lock
#[derive(Default)]
struct Inner {
    slot: TunnelSlot,
    /// Last known configuration
    config: Option<TunnelConfig>,
    /// Network the tunnel is bound to
    underlying: Option<NetworkId>,
    /// Connectivity epoch of the last transaction applied to health
    health_epoch: u64,
}

/// Shared controller state, also driven by the lifecycle worker
pub(crate) struct Core {
    factory: Arc<dyn AdapterFactory>,
    inner: Mutex<Inner>,
    connected: AtomicBool,
    /// Bumped on every connectivity transition
    epoch: AtomicU64,
    tracker: ConnectionTracker,
    observers: ObserverRegistry,
    options: ControllerOptions,
}

impl Core {
    fn new(factory: Arc<dyn AdapterFactory>, options: ControllerOptions) -> Self {
        Self {
            factory,
            inner: Mutex::new(Inner::default()),
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            tracker: ConnectionTracker::new(options.tracker_capacity),
            observers: ObserverRegistry::new(),
            options,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Build and start a fresh adapter; the caller holds the lock
    async fn build_adapter(&self, config: &TunnelConfig) -> Result<Box<dyn Adapter>, FactoryError> {
        let timeout = self.options.factory_timeout;
        let mut adapter = match tokio::time::timeout(timeout, self.factory.create(config)).await {
            Ok(result) => result?,
            Err(_) => return Err(FactoryError::Timeout(timeout)),
        };

        if let Err(e) = adapter.start(config.dns_mode, config.firewall_mode) {
            adapter.close();
            return Err(FactoryError::Start(e));
        }
        Ok(adapter)
    }

    pub(crate) async fn start(&self, config: TunnelConfig) -> Result<Started, StartError> {
        let mut inner = self.inner.lock().await;
        if inner.slot.is_running() {
            debug!("Adapter already running, start is a no-op");
            return Ok(Started::AlreadyRunning);
        }

        if let Err(e) = config.validate() {
            error!("Refusing to start adapter: {}", e);
            inner.config = Some(config);
            self.observers.notify(inner.slot.snapshot());
            return Err(StartError::Config(e));
        }

        info!("Starting adapter ({})", config.server_url);
        let built = self.build_adapter(&config).await;
        inner.config = Some(config);

        match built {
            Ok(adapter) => {
                if let Err(mut rejected) = inner.slot.install(adapter) {
                    rejected.close();
                    invariant_violated(StateInvariantViolation::DoubleInstall);
                }
                info!("Adapter started");
                self.observers.notify(inner.slot.snapshot());
                Ok(Started::Created)
            }
            Err(e) => {
                error!("Failed to start adapter: {}", e);
                self.observers.notify(inner.slot.snapshot());
                Err(StartError::Factory(e))
            }
        }
    }

    pub(crate) async fn restart(&self, config: TunnelConfig) -> Result<Restarted, RestartError> {
        let mut inner = self.inner.lock().await;
        self.restart_locked(&mut inner, config).await
    }

    /// Seamless handoff: the old adapter serves until its successor is up
    async fn restart_locked(&self, inner: &mut Inner, config: TunnelConfig) -> Result<Restarted, RestartError> {
        config.validate()?;

        if !inner.slot.is_running() {
            debug!("Restart requested while stopped, caching configuration");
            inner.config = Some(config);
            return Err(RestartError::NotRunning);
        }

        info!("Restarting adapter ({})", config.server_url);
        let replacement = match self.build_adapter(&config).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Restart failed, keeping current adapter: {}", e);
                return Err(RestartError::Factory(e));
            }
        };

        if let Some(mut old) = inner.slot.replace(replacement) {
            old.close();
        }
        inner.config = Some(config);

        info!("Adapter restarted");
        self.observers.notify(inner.slot.snapshot());
        Ok(Restarted)
    }

    pub(crate) async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        match inner.slot.take() {
            Some(mut adapter) => {
                info!("Stopping adapter");
                adapter.close();
                self.observers.notify(inner.slot.snapshot());
            }
            None => debug!("Adapter already stopped"),
        }
    }

    /// Push the cached configuration to the running adapter
    pub(crate) async fn refresh(&self) {
        let mut inner = self.inner.lock().await;
        Self::push_config(&mut inner);
    }

    fn push_config(inner: &mut Inner) {
        let Inner { slot, config, .. } = inner;
        let (Some(adapter), Some(config)) = (slot.adapter_mut(), config.as_ref()) else {
            debug!("No running adapter to update");
            return;
        };
        match adapter.update_config(config) {
            Ok(()) => debug!("Pushed resolver update ({})", config.server_url),
            Err(e) => warn!("Adapter rejected resolver update: {}", e),
        }
    }

    pub(crate) async fn on_config_changed(
        &self,
        key: ConfigKey,
        config: TunnelConfig,
    ) -> Result<ConfigAction, RestartError> {
        let mut inner = self.inner.lock().await;
        if inner.config.as_ref() == Some(&config) {
            return Ok(ConfigAction::Unchanged);
        }
        info!("Configuration changed: {}", key);
        self.dispatch_change_locked(&mut inner, key.requires_restart(), config).await
    }

    pub(crate) async fn apply_config(&self, config: TunnelConfig) -> Result<ConfigAction, RestartError> {
        let mut inner = self.inner.lock().await;
        let keys = match &inner.config {
            Some(current) => current.changes(&config),
            None => {
                inner.config = Some(config);
                return Ok(ConfigAction::Cached);
            }
        };
        if keys.is_empty() {
            return Ok(ConfigAction::Unchanged);
        }

        debug!("Configuration changed: {:?}", keys);
        let needs_restart = keys.iter().any(|k| k.requires_restart());
        self.dispatch_change_locked(&mut inner, needs_restart, config).await
    }

    async fn dispatch_change_locked(
        &self,
        inner: &mut Inner,
        needs_restart: bool,
        config: TunnelConfig,
    ) -> Result<ConfigAction, RestartError> {
        if !inner.slot.is_running() {
            inner.config = Some(config);
            return Ok(ConfigAction::Cached);
        }
        if needs_restart {
            self.restart_locked(inner, config).await?;
            Ok(ConfigAction::Restarted)
        } else {
            inner.config = Some(config);
            Self::push_config(inner);
            Ok(ConfigAction::Updated)
        }
    }

    pub(crate) async fn record_transaction(&self, transaction: Transaction) {
        let status = transaction.status;
        if let Err(e) = self.tracker.record(transaction) {
            warn!("Failed to record transaction: {}", e);
        }

        // Stale samples from a dead network must not move the health signal
        if !self.is_connected() {
            return;
        }

        let mut inner = self.inner.lock().await;
        // Epoch is read before the flag so a sample is never stamped with
        // an epoch newer than the connectivity it was checked against
        let epoch = self.epoch.load(Ordering::SeqCst);
        if !self.is_connected() {
            return;
        }
        inner.health_epoch = epoch;
        let next = inner.slot.health().after(status);
        if inner.slot.set_health(next) {
            debug!("Connection state: {}", next);
            self.observers.notify(inner.slot.snapshot());
        }
    }

    /// Worker side of a connectivity gain: start, then refresh
    pub(crate) async fn network_available(&self, network: Option<NetworkId>) {
        if !self.is_connected() {
            debug!("Network dropped again before start, skipping");
            return;
        }

        let config = {
            let mut inner = self.inner.lock().await;
            if network.is_some() {
                inner.underlying = network;
            }
            inner.config.clone()
        };

        match config {
            Some(config) => self.start_and_refresh(config).await,
            None => warn!("Network connected but no configuration received yet"),
        }
    }

    /// Worker side of a connectivity loss observed at `epoch`
    ///
    /// Health applied after a later reconnect is left alone.
    pub(crate) async fn network_lost(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        inner.underlying = None;
        if inner.health_epoch > epoch {
            debug!("Network came back with fresh samples, keeping health");
        } else {
            inner.slot.set_health(ConnectionState::New);
        }
        self.observers.notify(inner.slot.snapshot());
    }

    /// Host start command: remember the config, start if online
    pub(crate) async fn start_when_connected(&self, config: TunnelConfig) {
        if !self.is_connected() {
            info!("Start deferred until the network is available");
            let mut inner = self.inner.lock().await;
            if !inner.slot.is_running() {
                inner.config = Some(config);
            }
            return;
        }
        self.start_and_refresh(config).await;
    }

    async fn start_and_refresh(&self, config: TunnelConfig) {
        match self.start(config).await {
            Ok(_) => self.refresh().await,
            Err(e) => {
                error!("Failed to start VPN adapter: {}", e);
                self.observers.notify_start_failed(&e);
            }
        }
    }
}

/// Lifecycle controller for the single tunnel adapter
///
/// Cheap to clone; all clones drive the same adapter. Must be created
/// inside a Tokio runtime because it spawns the lifecycle worker.
#[derive(Clone)]
pub struct TunnelController {
    core: Arc<Core>,
    commands: mpsc::Sender<LifecycleCommand>,
    worker: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    listeners: Arc<std::sync::Mutex<Vec<AbortHandle>>>,
}

impl TunnelController {
    /// Create a controller and spawn its lifecycle worker
    pub fn new<F: AdapterFactory>(factory: F, options: ControllerOptions) -> Self {
        Self::with_factory(Arc::new(factory), options)
    }

    /// Create a controller from a shared factory
    pub fn with_factory(factory: Arc<dyn AdapterFactory>, options: ControllerOptions) -> Self {
        let capacity = options.queue_capacity;
        let core = Arc::new(Core::new(factory, options));
        let (commands, worker) = spawn_worker(core.clone(), capacity);

        Self {
            core,
            commands,
            worker: Arc::new(std::sync::Mutex::new(Some(worker))),
            listeners: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Register an observer for state changes
    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) -> Subscription {
        self.core.observers.subscribe(observer)
    }

    /// Start the adapter if none is running
    ///
    /// A failure is fatal: the host should stop its service.
    pub async fn start(&self, config: TunnelConfig) -> Result<Started, StartError> {
        self.core.start(config).await
    }

    /// Replace the running adapter, keeping the old one on failure
    pub async fn restart(&self, config: TunnelConfig) -> Result<Restarted, RestartError> {
        self.core.restart(config).await
    }

    /// Close the running adapter, if any
    pub async fn stop(&self) {
        self.core.stop().await
    }

    /// Push the cached configuration to the running adapter
    pub async fn refresh(&self) {
        self.core.refresh().await
    }

    /// React to a change of a single setting
    ///
    /// Restart-class keys rebuild the adapter; a URL change is pushed to
    /// the running adapter. While stopped the snapshot is only cached.
    pub async fn on_config_changed(
        &self,
        key: ConfigKey,
        config: TunnelConfig,
    ) -> Result<ConfigAction, RestartError> {
        self.core.on_config_changed(key, config).await
    }

    /// Diff `config` against the cached snapshot and apply the cheapest
    /// sufficient action
    pub async fn apply_config(&self, config: TunnelConfig) -> Result<ConfigAction, RestartError> {
        self.core.apply_config(config).await
    }

    /// Record a finalized transaction and update connection health
    pub async fn record_transaction(&self, transaction: Transaction) {
        self.core.record_transaction(transaction).await
    }

    /// Network came up; the adapter is started on the lifecycle worker
    pub fn on_network_connected(&self) {
        self.on_connectivity(Connectivity::Connected(None));
    }

    /// Network came up on a specific interface
    pub fn on_network_connected_via(&self, network: NetworkId) {
        self.on_connectivity(Connectivity::Connected(Some(network)));
    }

    /// Network went down; the adapter keeps running
    pub fn on_network_disconnected(&self) {
        self.on_connectivity(Connectivity::Disconnected);
    }

    /// Apply a connectivity transition without blocking the caller
    pub fn on_connectivity(&self, connectivity: Connectivity) {
        let command = self.note_connectivity(connectivity);
        if let Err(e) = self.submit(command) {
            error!("Dropped connectivity event: {}", e);
        }
    }

    /// Flip the connectivity flag and build the matching worker job
    pub(crate) fn note_connectivity(&self, connectivity: Connectivity) -> LifecycleCommand {
        match connectivity {
            Connectivity::Connected(network) => {
                info!("Network connected");
                self.core.epoch.fetch_add(1, Ordering::SeqCst);
                self.core.connected.store(true, Ordering::SeqCst);
                LifecycleCommand::NetworkConnected(network)
            }
            Connectivity::Disconnected => {
                info!("Network disconnected");
                self.core.connected.store(false, Ordering::SeqCst);
                let epoch = self.core.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                LifecycleCommand::NetworkDisconnected(epoch)
            }
        }
    }

    /// Queue a single-setting change for the lifecycle worker
    pub fn submit_config_change(&self, key: ConfigKey, config: TunnelConfig) -> Result<(), WorkerError> {
        self.submit(LifecycleCommand::ConfigChanged(key, config))
    }

    /// Queue a host command for the lifecycle worker
    pub fn dispatch(&self, command: ServiceCommand) -> Result<(), WorkerError> {
        self.submit(LifecycleCommand::Service(command))
    }

    pub(crate) fn submit(&self, command: LifecycleCommand) -> Result<(), WorkerError> {
        Ok(self.commands.try_send(command)?)
    }

    /// Queue a job, waiting for room in the queue
    pub(crate) async fn submit_wait(&self, command: LifecycleCommand) -> Result<(), WorkerError> {
        Ok(self.commands.send(command).await?)
    }

    /// Wait until every job queued so far has run
    pub async fn flush(&self) -> Result<(), WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.submit_wait(LifecycleCommand::Flush(tx)).await?;
        rx.await.map_err(|_| WorkerError::Gone)
    }

    pub(crate) fn track_listener(&self, handle: AbortHandle) {
        let mut listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|listener| !listener.is_finished());
        listeners.push(handle);
    }

    #[cfg(test)]
    pub(crate) fn tracked_listeners(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Stop listeners, drain the worker and close the adapter
    pub async fn shutdown(&self) {
        info!("Shutting down tunnel controller");

        let listeners = match self.listeners.lock() {
            Ok(mut listeners) => std::mem::take(&mut *listeners),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for listener in listeners {
            listener.abort();
        }

        if self.submit_wait(LifecycleCommand::Shutdown).await.is_err() {
            debug!("Lifecycle worker already gone");
        }
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Lifecycle worker ended abnormally: {}", e);
            }
        }

        self.core.stop().await;
        self.core.observers.clear();
    }

    /// Current adapter presence and health
    pub async fn snapshot(&self) -> StateSnapshot {
        self.core.inner.lock().await.slot.snapshot()
    }

    /// Current health (NEW while stopped)
    pub async fn connection_state(&self) -> ConnectionState {
        self.core.inner.lock().await.slot.health()
    }

    /// Is the tunnel on?
    pub async fn is_running(&self) -> bool {
        self.core.inner.lock().await.slot.is_running()
    }

    /// Last known configuration
    pub async fn config(&self) -> Option<TunnelConfig> {
        self.core.inner.lock().await.config.clone()
    }

    /// Network the tunnel is currently bound to
    pub async fn underlying_network(&self) -> Option<NetworkId> {
        self.core.inner.lock().await.underlying.clone()
    }

    /// Is the network believed to be up?
    pub fn is_network_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Transaction log
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.core.tracker
    }

    /// Format status for display
    pub async fn status(&self) -> String {
        let snapshot = self.snapshot().await;
        let state = match snapshot.connection {
            Some(state) => state.as_str(),
            None => "off",
        };
        format!(
            "Tunnel: {} | Network: {} | {}",
            state,
            if self.is_network_connected() { "up" } else { "down" },
            self.tracker().stats().format()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterError;
    use crate::config::DnsMode;
    use crate::testing::{config, AdapterEvent, MockFactory, RecordingObserver};
    use crate::transaction::TransactionStatus;

    fn controller(factory: &MockFactory) -> TunnelController {
        TunnelController::new(factory.clone(), ControllerOptions::default())
    }

    fn tx(status: TransactionStatus) -> Transaction {
        Transaction::completed("example.org", status)
    }

    /// Bring the network up, then start the tunnel through the worker
    async fn online(controller: &TunnelController) {
        controller.on_network_connected();
        controller.dispatch(ServiceCommand::Start(config())).unwrap();
        controller.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_then_complete_is_working() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        let observer = Arc::new(RecordingObserver::default());
        let _sub = controller.subscribe(observer.clone());

        online(&controller).await;
        assert_eq!(controller.snapshot().await, StateSnapshot::running(ConnectionState::New));

        controller.record_transaction(tx(TransactionStatus::Complete)).await;
        assert_eq!(controller.connection_state().await, ConnectionState::Working);
        assert_eq!(observer.last(), Some(StateSnapshot::running(ConnectionState::Working)));
    }

    #[tokio::test]
    async fn test_failed_then_canceled_stays_failing() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;

        controller.record_transaction(tx(TransactionStatus::Complete)).await;
        controller.record_transaction(tx(TransactionStatus::Failed)).await;
        assert_eq!(controller.connection_state().await, ConnectionState::Failing);

        controller.record_transaction(tx(TransactionStatus::Canceled)).await;
        assert_eq!(controller.connection_state().await, ConnectionState::Failing);
    }

    #[tokio::test]
    async fn test_all_canceled_stays_new() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;

        for _ in 0..5 {
            controller.record_transaction(tx(TransactionStatus::Canceled)).await;
        }
        assert_eq!(controller.connection_state().await, ConnectionState::New);
        assert_eq!(controller.tracker().stats().canceled, 5);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let factory = MockFactory::new();
        let controller = controller(&factory);

        assert_eq!(controller.start(config()).await, Ok(Started::Created));
        assert_eq!(controller.start(config()).await, Ok(Started::AlreadyRunning));
        assert_eq!(factory.create_calls(), 1);
        assert_eq!(factory.live_adapters(), vec![1]);
    }

    #[tokio::test]
    async fn test_start_failure_is_fatal() {
        let factory = MockFactory::new();
        factory.fail_next(1);
        let controller = controller(&factory);
        let observer = Arc::new(RecordingObserver::default());
        let _sub = controller.subscribe(observer.clone());

        let result = controller.start(config()).await;
        assert!(matches!(result, Err(StartError::Factory(FactoryError::Establish(_)))));
        assert!(!controller.is_running().await);
        assert_eq!(observer.last(), Some(StateSnapshot::stopped()));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let factory = MockFactory::new();
        let controller = controller(&factory);

        let result = controller.start(TunnelConfig::new("")).await;
        assert_eq!(result, Err(StartError::Config(ConfigError::MissingUrl)));
        assert_eq!(factory.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_adapter_start_failure_closes_adapter() {
        let factory = MockFactory::new();
        factory.fail_start(true);
        let controller = controller(&factory);

        let result = controller.start(config()).await;
        assert!(matches!(
            result,
            Err(StartError::Factory(FactoryError::Start(AdapterError::StartFailed(_))))
        ));
        assert!(factory.live_adapters().is_empty());
        assert!(!controller.is_running().await);
    }

    #[tokio::test]
    async fn test_worker_start_failure_reported() {
        let factory = MockFactory::new();
        factory.fail_next(1);
        let controller = controller(&factory);
        let observer = Arc::new(RecordingObserver::default());
        let _sub = controller.subscribe(observer.clone());

        online(&controller).await;
        assert_eq!(observer.start_failures(), 1);
        assert!(!controller.is_running().await);
    }

    #[tokio::test]
    async fn test_factory_timeout() {
        let factory = MockFactory::new();
        factory.delay(Duration::from_millis(200));
        let options = ControllerOptions {
            factory_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let controller = TunnelController::new(factory.clone(), options);

        let result = controller.start(config()).await;
        assert_eq!(
            result,
            Err(StartError::Factory(FactoryError::Timeout(Duration::from_millis(20))))
        );
        assert!(factory.live_adapters().is_empty());
    }

    #[tokio::test]
    async fn test_restart_builds_before_closing() {
        let factory = MockFactory::new();
        factory.delay(Duration::from_millis(20));
        let controller = controller(&factory);
        controller.start(config()).await.unwrap();

        let next = config().with_dns_mode(DnsMode::DnsCrypt);
        assert_eq!(controller.restart(next.clone()).await, Ok(Restarted));

        assert_eq!(
            factory.events(),
            vec![
                AdapterEvent::Created(1),
                AdapterEvent::Started(1),
                AdapterEvent::Created(2),
                AdapterEvent::Started(2),
                AdapterEvent::Closed(1),
            ]
        );
        assert_eq!(factory.live_adapters(), vec![2]);
        assert_eq!(controller.config().await, Some(next));
    }

    #[tokio::test]
    async fn test_restart_failure_keeps_old_adapter() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        controller.start(config()).await.unwrap();
        controller.on_network_connected();
        controller.flush().await.unwrap();
        controller.record_transaction(tx(TransactionStatus::Complete)).await;

        factory.fail_next(1);
        let result = controller.restart(config().with_dns_mode(DnsMode::Proxy)).await;

        assert!(matches!(result, Err(RestartError::Factory(_))));
        assert_eq!(factory.live_adapters(), vec![1]);
        assert_eq!(controller.snapshot().await, StateSnapshot::running(ConnectionState::Working));
        assert_eq!(controller.config().await, Some(config()));
    }

    #[tokio::test]
    async fn test_restart_while_stopped() {
        let factory = MockFactory::new();
        let controller = controller(&factory);

        let result = controller.restart(config()).await;
        assert_eq!(result, Err(RestartError::NotRunning));
        assert_eq!(factory.create_calls(), 0);
        assert_eq!(controller.config().await, Some(config()));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_resets() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;
        controller.record_transaction(tx(TransactionStatus::Complete)).await;

        controller.stop().await;
        controller.stop().await;
        assert_eq!(controller.snapshot().await, StateSnapshot::stopped());
        assert!(factory.live_adapters().is_empty());

        controller.record_transaction(tx(TransactionStatus::Complete)).await;
        controller.record_transaction(tx(TransactionStatus::Failed)).await;
        assert_eq!(controller.connection_state().await, ConnectionState::New);
        assert_eq!(controller.snapshot().await, StateSnapshot::stopped());
    }

    #[tokio::test]
    async fn test_stop_during_restart_tears_down_winner() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        controller.start(config()).await.unwrap();
        factory.delay(Duration::from_millis(50));

        let restarting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.restart(config().with_dns_mode(DnsMode::Proxy)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.stop().await;

        assert_eq!(restarting.await.unwrap(), Ok(Restarted));
        assert!(factory.live_adapters().is_empty());
        assert!(!controller.is_running().await);

        let events = factory.events();
        let created_2 = events.iter().position(|e| *e == AdapterEvent::Created(2)).unwrap();
        let closed_1 = events.iter().position(|e| *e == AdapterEvent::Closed(1)).unwrap();
        assert!(created_2 < closed_1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_build_one_adapter() {
        let factory = MockFactory::new();
        factory.delay(Duration::from_millis(20));
        let controller = controller(&factory);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.start(config()).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(factory.create_calls(), 1);
        assert_eq!(factory.live_adapters().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_gating() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;

        controller.on_network_disconnected();
        controller.flush().await.unwrap();
        controller.record_transaction(tx(TransactionStatus::Complete)).await;
        controller.record_transaction(tx(TransactionStatus::Failed)).await;

        assert_eq!(controller.connection_state().await, ConnectionState::New);
        assert!(controller.is_running().await);
        assert_eq!(controller.tracker().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_resets_health_and_binding() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        controller.on_network_connected_via(NetworkId::new("wlan0"));
        controller.dispatch(ServiceCommand::Start(config())).unwrap();
        controller.flush().await.unwrap();
        controller.record_transaction(tx(TransactionStatus::Failed)).await;
        assert_eq!(controller.underlying_network().await, Some(NetworkId::new("wlan0")));

        controller.on_network_disconnected();
        controller.flush().await.unwrap();

        assert_eq!(controller.connection_state().await, ConnectionState::New);
        assert_eq!(controller.underlying_network().await, None);
        assert_eq!(factory.live_adapters(), vec![1]);
    }

    #[tokio::test]
    async fn test_late_disconnect_keeps_fresh_health() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;

        // Network flaps; a sample lands before the queued loss job runs
        controller.on_network_disconnected();
        controller.on_network_connected();
        controller.record_transaction(tx(TransactionStatus::Complete)).await;
        assert_eq!(controller.connection_state().await, ConnectionState::Working);

        controller.flush().await.unwrap();
        assert!(controller.is_network_connected());
        assert_eq!(controller.connection_state().await, ConnectionState::Working);

        // A plain disconnect still resets
        controller.on_network_disconnected();
        controller.flush().await.unwrap();
        assert_eq!(controller.connection_state().await, ConnectionState::New);
    }

    #[tokio::test]
    async fn test_stop_during_start_tears_down_new_adapter() {
        let factory = MockFactory::new();
        factory.delay(Duration::from_millis(50));
        let controller = controller(&factory);
        let observer = Arc::new(RecordingObserver::default());
        let _sub = controller.subscribe(observer.clone());

        let starting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start(config()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.stop().await;

        assert_eq!(starting.await.unwrap(), Ok(Started::Created));
        assert!(!controller.is_running().await);
        assert!(factory.live_adapters().is_empty());
        assert_eq!(
            observer.snapshots(),
            vec![StateSnapshot::running(ConnectionState::New), StateSnapshot::stopped()]
        );
    }

    #[tokio::test]
    async fn test_reconnect_starts_once() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        controller.dispatch(ServiceCommand::Start(config())).unwrap();
        controller.flush().await.unwrap();
        assert_eq!(factory.create_calls(), 0);

        controller.on_network_disconnected();
        controller.on_network_connected();
        controller.flush().await.unwrap();
        assert_eq!(factory.create_calls(), 1);

        // Adapter already up: reconnecting does not build another one
        controller.on_network_disconnected();
        controller.on_network_connected();
        controller.flush().await.unwrap();
        assert_eq!(factory.create_calls(), 1);
        assert_eq!(factory.live_adapters(), vec![1]);
    }

    #[tokio::test]
    async fn test_connect_pushes_config_after_start() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;

        assert_eq!(
            factory.events(),
            vec![
                AdapterEvent::Created(1),
                AdapterEvent::Started(1),
                AdapterEvent::Updated(1, config().server_url),
            ]
        );
    }

    #[tokio::test]
    async fn test_config_change_dispatch() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        controller.start(config()).await.unwrap();

        let same = controller.on_config_changed(ConfigKey::Apps, config()).await;
        assert_eq!(same, Ok(ConfigAction::Unchanged));

        let apps = config().with_excluded_app("org.example.chat");
        let restarted = controller.on_config_changed(ConfigKey::Apps, apps.clone()).await;
        assert_eq!(restarted, Ok(ConfigAction::Restarted));
        assert_eq!(factory.create_calls(), 2);

        let mut url = apps.clone();
        url.server_url = "https://other.example.net/dns-query".into();
        let updated = controller.on_config_changed(ConfigKey::Url, url.clone()).await;
        assert_eq!(updated, Ok(ConfigAction::Updated));
        assert_eq!(factory.create_calls(), 2);
        assert_eq!(
            factory.events().last(),
            Some(&AdapterEvent::Updated(2, url.server_url.clone()))
        );
    }

    #[tokio::test]
    async fn test_config_change_while_stopped_is_cached() {
        let factory = MockFactory::new();
        let controller = controller(&factory);

        let next = config().with_dns_mode(DnsMode::DnsCrypt);
        let action = controller.on_config_changed(ConfigKey::DnsMode, next.clone()).await;
        assert_eq!(action, Ok(ConfigAction::Cached));
        assert_eq!(factory.create_calls(), 0);
        assert_eq!(controller.config().await, Some(next));
    }

    #[tokio::test]
    async fn test_apply_config_picks_cheapest_action() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        controller.start(config()).await.unwrap();

        assert_eq!(controller.apply_config(config()).await, Ok(ConfigAction::Unchanged));

        let mut url = config();
        url.server_url = "https://other.example.net/dns-query".into();
        assert_eq!(controller.apply_config(url.clone()).await, Ok(ConfigAction::Updated));
        assert_eq!(factory.create_calls(), 1);

        let mut both = url.with_dns_mode(DnsMode::Proxy);
        both.server_url = "https://third.example.net/dns-query".into();
        assert_eq!(controller.apply_config(both).await, Ok(ConfigAction::Restarted));
        assert_eq!(factory.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_submitted_config_change_runs_on_worker() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;

        let next = config().with_excluded_app("org.example.chat");
        controller.submit_config_change(ConfigKey::Apps, next.clone()).unwrap();
        controller.flush().await.unwrap();

        assert_eq!(factory.create_calls(), 2);
        assert_eq!(factory.live_adapters(), vec![2]);
        assert_eq!(controller.config().await, Some(next));
    }

    #[tokio::test]
    async fn test_stop_command() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;

        controller.dispatch(ServiceCommand::Stop).unwrap();
        controller.flush().await.unwrap();
        assert!(!controller.is_running().await);
    }

    #[tokio::test]
    async fn test_observers_see_every_mutation() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        let observer = Arc::new(RecordingObserver::default());
        let _sub = controller.subscribe(observer.clone());

        online(&controller).await;
        controller.record_transaction(tx(TransactionStatus::Complete)).await;
        controller.stop().await;

        assert_eq!(
            observer.snapshots(),
            vec![
                StateSnapshot::running(ConnectionState::New),
                StateSnapshot::running(ConnectionState::Working),
                StateSnapshot::stopped(),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_adapter() {
        let factory = MockFactory::new();
        let controller = controller(&factory);
        online(&controller).await;

        controller.shutdown().await;
        assert!(factory.live_adapters().is_empty());
        assert_eq!(controller.dispatch(ServiceCommand::Stop), Err(WorkerError::Gone));
    }
}
