//! Test doubles shared by the unit tests.

use crate::adapter::{Adapter, AdapterError, AdapterFactory, FactoryError};
use crate::config::{DnsMode, FirewallMode, TunnelConfig};
use crate::controller::StartError;
use crate::observer::StateObserver;
use crate::state::StateSnapshot;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything a mock adapter was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    Created(u64),
    Started(u64),
    Updated(u64, String),
    Closed(u64),
}

#[derive(Default)]
struct FactoryState {
    next_id: AtomicU64,
    create_calls: AtomicUsize,
    fail_creates: AtomicUsize,
    fail_start: AtomicBool,
    delay_ms: AtomicU64,
    events: Mutex<Vec<AdapterEvent>>,
}

/// Factory producing [`MockAdapter`]s that log into a shared event list
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<FactoryState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` create calls fail
    pub fn fail_next(&self, n: usize) {
        self.state.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Make adapters fail in `start`
    pub fn fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Delay every create call
    pub fn delay(&self, delay: Duration) {
        self.state.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<AdapterEvent> {
        self.state.events.lock().unwrap().clone()
    }

    /// Adapters created and not yet closed
    pub fn live_adapters(&self) -> Vec<u64> {
        let events = self.events();
        events
            .iter()
            .filter_map(|e| match e {
                AdapterEvent::Created(id) => Some(*id),
                _ => None,
            })
            .filter(|id| !events.contains(&AdapterEvent::Closed(*id)))
            .collect()
    }

    fn push(&self, event: AdapterEvent) {
        self.state.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl AdapterFactory for MockFactory {
    async fn create(&self, _config: &TunnelConfig) -> Result<Box<dyn Adapter>, FactoryError> {
        self.state.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failing = self
            .state
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FactoryError::Establish("mock failure".into()));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.push(AdapterEvent::Created(id));
        Ok(Box::new(MockAdapter {
            id,
            factory: self.clone(),
        }))
    }
}

pub struct MockAdapter {
    id: u64,
    factory: MockFactory,
}

impl Adapter for MockAdapter {
    fn start(&mut self, _dns_mode: DnsMode, _firewall_mode: FirewallMode) -> Result<(), AdapterError> {
        if self.factory.state.fail_start.load(Ordering::SeqCst) {
            return Err(AdapterError::StartFailed("mock start failure".into()));
        }
        self.factory.push(AdapterEvent::Started(self.id));
        Ok(())
    }

    fn update_config(&mut self, config: &TunnelConfig) -> Result<(), AdapterError> {
        self.factory
            .push(AdapterEvent::Updated(self.id, config.server_url.clone()));
        Ok(())
    }

    fn close(&mut self) {
        self.factory.push(AdapterEvent::Closed(self.id));
    }
}

/// Observer that keeps every notification
#[derive(Default)]
pub struct RecordingObserver {
    snapshots: Mutex<Vec<StateSnapshot>>,
    start_failures: AtomicUsize,
}

impl RecordingObserver {
    pub fn snapshots(&self) -> Vec<StateSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<StateSnapshot> {
        self.snapshots.lock().unwrap().last().copied()
    }

    pub fn start_failures(&self) -> usize {
        self.start_failures.load(Ordering::SeqCst)
    }
}

impl StateObserver for RecordingObserver {
    fn on_state_changed(&self, snapshot: StateSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
    }

    fn on_start_failed(&self, _error: &StartError) {
        self.start_failures.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn config() -> TunnelConfig {
    TunnelConfig::new("https://dns.example.net/dns-query")
}
