//! Vigil Service
//!
//! Host process for the tunnel controller. Loads settings, wires a
//! dry-run adapter behind the blocklist gate and drives the controller
//! from line commands on stdin:
//!
//! ```text
//! start | stop | restart
//! net up [network] | net down
//! set <key> <value>          keys: url, dns_mode, firewall_mode, apps, local_blocklist
//! tx ok|fail|cancel [name]
//! status | quit
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vigil_tunnel::{
    Adapter, AdapterError, AdapterFactory, AppId, BlocklistGate, ChannelObserver, ConfigKey,
    DnsMode, FactoryError, FirewallMode, NetworkId, ObserverEvent, ServiceCommand,
    ServiceSettings, Transaction, TransactionStatus, TunnelConfig, TunnelController,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Adapter that only logs what a real tunnel would do
struct DryRunAdapter {
    id: u64,
    server_url: String,
}

impl Adapter for DryRunAdapter {
    fn start(&mut self, dns_mode: DnsMode, firewall_mode: FirewallMode) -> Result<(), AdapterError> {
        info!("[adapter {}] start: dns={:?} firewall={:?} via {}", self.id, dns_mode, firewall_mode, self.server_url);
        Ok(())
    }

    fn update_config(&mut self, config: &TunnelConfig) -> Result<(), AdapterError> {
        info!("[adapter {}] resolver -> {}", self.id, config.server_url);
        self.server_url = config.server_url.clone();
        Ok(())
    }

    fn close(&mut self) {
        info!("[adapter {}] closed", self.id);
    }
}

#[derive(Default)]
struct DryRunFactory {
    next_id: AtomicU64,
}

#[async_trait]
impl AdapterFactory for DryRunFactory {
    async fn create(&self, config: &TunnelConfig) -> Result<Box<dyn Adapter>, FactoryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let routing = config.app_routing(&AppId::new(env!("CARGO_PKG_NAME")));
        info!("[adapter {}] created, routing: {:?}", id, routing);
        Ok(Box::new(DryRunAdapter {
            id,
            server_url: config.server_url.clone(),
        }))
    }
}

fn load_settings(path: Option<&str>) -> Result<ServiceSettings> {
    match path {
        Some(path) => ServiceSettings::from_file(Path::new(path))
            .with_context(|| format!("Failed to load settings from {}", path)),
        None => Ok(ServiceSettings::default()),
    }
}

fn parse_dns_mode(value: &str) -> Result<DnsMode> {
    Ok(match value {
        "doh" => DnsMode::Doh,
        "dns_crypt" | "dnscrypt" => DnsMode::DnsCrypt,
        "proxy" => DnsMode::Proxy,
        other => bail!("Unknown DNS mode: {}", other),
    })
}

fn parse_firewall_mode(value: &str) -> Result<FirewallMode> {
    Ok(match value {
        "off" => FirewallMode::Off,
        "filter" => FirewallMode::Filter,
        "sinkhole" => FirewallMode::Sinkhole,
        other => bail!("Unknown firewall mode: {}", other),
    })
}

/// Apply `set <key> <value>` to a copy of `current`
fn edit_config(current: &TunnelConfig, key: ConfigKey, value: &str) -> Result<TunnelConfig> {
    let mut next = current.clone();
    match key {
        ConfigKey::Url => next.server_url = value.to_string(),
        ConfigKey::DnsMode => next.dns_mode = parse_dns_mode(value)?,
        ConfigKey::FirewallMode => next.firewall_mode = parse_firewall_mode(value)?,
        ConfigKey::Apps => {
            next.excluded_apps = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(AppId::new)
                .collect();
        }
        ConfigKey::LocalBlocklist => {
            next.local_blocklist = match value {
                "" | "none" => None,
                stamp => Some(stamp.to_string()),
            };
        }
    }
    next.validate()?;
    Ok(next)
}

fn parse_status(value: &str) -> Result<TransactionStatus> {
    Ok(match value {
        "ok" | "complete" => TransactionStatus::Complete,
        "fail" | "failed" => TransactionStatus::Failed,
        "cancel" | "canceled" => TransactionStatus::Canceled,
        other => bail!("Unknown transaction status: {}", other),
    })
}

/// Handle one stdin line; returns false on `quit`
async fn handle_line(controller: &TunnelController, config: &mut Option<TunnelConfig>, line: &str) -> Result<bool> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["quit"] | ["exit"] => return Ok(false),
        ["start"] => match config {
            Some(config) => controller.dispatch(ServiceCommand::Start(config.clone()))?,
            None => warn!("No tunnel configuration; use `set url <url>` first"),
        },
        ["stop"] => controller.dispatch(ServiceCommand::Stop)?,
        ["restart"] => match config {
            Some(config) => controller.dispatch(ServiceCommand::Restart(config.clone()))?,
            None => warn!("No tunnel configuration to restart with"),
        },
        ["net", "up"] => controller.on_network_connected(),
        ["net", "up", network] => controller.on_network_connected_via(NetworkId::new(*network)),
        ["net", "down"] => controller.on_network_disconnected(),
        ["set", key, rest @ ..] => {
            let key: ConfigKey = key.parse()?;
            let value = rest.join(" ");
            let next = match config {
                Some(current) => edit_config(current, key, &value)?,
                None if key == ConfigKey::Url => TunnelConfig::new(value),
                None => bail!("Set the server url first"),
            };
            controller.submit_config_change(key, next.clone())?;
            *config = Some(next);
        }
        ["tx", status, rest @ ..] => {
            let name = rest.first().copied().unwrap_or("example.com");
            controller
                .record_transaction(Transaction::completed(name, parse_status(status)?))
                .await;
        }
        ["status"] => {
            println!("{}", controller.status().await);
            if let Some(network) = controller.underlying_network().await {
                println!("Bound to: {}", network);
            }
        }
        _ => warn!("Unknown command: {}", line.trim()),
    }
    Ok(true)
}

/// Print an observer event; a failed start wakes the main loop so the
/// service stops
fn report(event: ObserverEvent, start_failed: &Notify) {
    match event {
        ObserverEvent::StateChanged(snapshot) => match snapshot.connection {
            Some(state) => println!("tunnel: on ({})", state),
            None => println!("tunnel: off"),
        },
        ObserverEvent::StartFailed(reason) => {
            println!("tunnel: start failed ({}), stopping service", reason);
            start_failed.notify_one();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings_path = std::env::args().nth(1);
    let settings = load_settings(settings_path.as_deref())?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)))
        .init();

    info!("Vigil service starting...");
    info!("Using mimalloc allocator");
    match &settings_path {
        Some(path) => info!("Loaded settings from {}", path),
        None => info!("No settings file given, using defaults"),
    }

    let factory = BlocklistGate::new(DryRunFactory::default(), settings.blocklist_store());
    let controller = TunnelController::new(factory, settings.controller_options());

    // State changes are printed off the controller's tasks
    let (events_tx, events_rx) = crossbeam_channel::bounded(64);
    let _subscription = controller.subscribe(Arc::new(ChannelObserver::new(events_tx)));
    let start_failed = Arc::new(Notify::new());
    let failed = start_failed.clone();
    let printer = std::thread::spawn(move || {
        for event in events_rx {
            report(event, &failed);
        }
    });

    let mut config = settings.tunnel.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = start_failed.notified() => {
                error!("Tunnel could not be started, stopping service");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        match handle_line(&controller, &mut config, &line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => error!("{:#}", e),
        }
    }

    controller.shutdown().await;
    drop(_subscription);
    if printer.join().is_err() {
        error!("Event printer panicked");
    }

    info!("Vigil service shutting down");
    Ok(())
}
