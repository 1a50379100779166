//! State observers
//!
//! Observers are registered explicitly and stay registered for as long
//! as their [`Subscription`] guard lives. Notifications are delivered on
//! whichever task mutated the controller, while it still holds the
//! controller lock, so observers must return quickly.

use crate::controller::StartError;
use crate::state::StateSnapshot;
use crossbeam_channel::{Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, warn};

/// Receives controller state changes
pub trait StateObserver: Send + Sync {
    /// Called after every controller-state mutation
    fn on_state_changed(&self, snapshot: StateSnapshot);

    /// Called when a start driven by the lifecycle worker fails
    ///
    /// The host is expected to stop its service in response.
    fn on_start_failed(&self, _error: &StartError) {}
}

/// Events forwarded by [`ChannelObserver`]
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    StateChanged(StateSnapshot),
    StartFailed(String),
}

/// Observer that forwards into a channel without ever blocking
///
/// Events are dropped when the channel is full or disconnected.
pub struct ChannelObserver {
    tx: Sender<ObserverEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<ObserverEvent>) -> Self {
        Self { tx }
    }

    fn forward(&self, event: ObserverEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Observer channel full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => debug!("Observer channel closed"),
        }
    }
}

impl StateObserver for ChannelObserver {
    fn on_state_changed(&self, snapshot: StateSnapshot) {
        self.forward(ObserverEvent::StateChanged(snapshot));
    }

    fn on_start_failed(&self, error: &StartError) {
        self.forward(ObserverEvent::StartFailed(error.to_string()));
    }
}

type ObserverList = RwLock<Vec<(u64, Arc<dyn StateObserver>)>>;

/// Set of registered observers
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Arc<ObserverList>,
    next_id: AtomicU64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` until the returned guard is dropped
    #[must_use = "dropping the subscription unregisters the observer"]
    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.observers.write() {
            Ok(mut observers) => observers.push((id, observer)),
            Err(poisoned) => poisoned.into_inner().push((id, observer)),
        }
        debug!("Observer {} subscribed", id);
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration
    pub fn clear(&self) {
        if let Ok(mut observers) = self.observers.write() {
            observers.clear();
        }
    }

    pub(crate) fn notify(&self, snapshot: StateSnapshot) {
        for observer in self.current() {
            observer.on_state_changed(snapshot);
        }
    }

    pub(crate) fn notify_start_failed(&self, error: &StartError) {
        for observer in self.current() {
            observer.on_start_failed(error);
        }
    }

    /// Clone the list so callbacks run without holding the registry lock
    fn current(&self) -> Vec<Arc<dyn StateObserver>> {
        match self.observers.read() {
            Ok(observers) => observers.iter().map(|(_, o)| o.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, o)| o.clone()).collect(),
        }
    }
}

/// Registration guard returned by [`ObserverRegistry::subscribe`]
pub struct Subscription {
    id: u64,
    observers: Weak<ObserverList>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(observers) = self.observers.upgrade() else {
            return;
        };
        let mut observers = match observers.write() {
            Ok(observers) => observers,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.retain(|(id, _)| *id != self.id);
        debug!("Observer {} unsubscribed", self.id);
    }
}
