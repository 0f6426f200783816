//! Tunnel lifecycle.
//!
//! The manager owns the tunnel handle and the drain task. On start it works
//! out which applications are blocked on the current transport, routes
//! everything else around the tunnel and then discards whatever arrives on it.

mod config;

pub use config::{blocked_set, TunnelApp, TunnelConfig, NULL_ROUTE};

use crate::classifier::{FlowOwnerResolver, PacketClassifier, PacketDecision};
use crate::config::{Config, TunnelSettings};
use crate::error::{NetwardenError, Result};
use crate::log_batcher::LogBatcher;
use crate::rule_cache::RuleCache;
use crate::store::{AppRegistry, RuleStore};
use crate::traffic::TrafficTracker;
use crate::transport::TransportMonitor;
use crate::types::{TunnelState, Uid};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Drained packets waiting for an owner lookup; the drain drops past this
const INSPECTION_QUEUE: usize = 256;
const INSPECTION_BATCH: usize = 32;

/// Creates the OS tunnel device
pub trait TunnelBuilder: Send + Sync {
    fn establish(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelInterface>>;
}

/// An established tunnel in non-blocking mode.
///
/// `read_packet` returns `Ok(0)` or `WouldBlock` when nothing is queued, and
/// `NotConnected` once the OS has revoked the tunnel.
pub trait TunnelInterface: Send + Sync {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&self);
}

/// Optional per-packet classification off the drain path.
///
/// The drain hands copies to a worker that resolves owners on the blocking
/// pool, so a slow resolver costs classifications, never drain throughput.
pub struct PacketInspection {
    pub classifier: Arc<PacketClassifier>,
    pub resolver: Arc<dyn FlowOwnerResolver>,
}

pub struct TunnelDeps {
    pub rules: Arc<dyn RuleStore>,
    pub registry: Arc<dyn AppRegistry>,
    pub builder: Arc<dyn TunnelBuilder>,
    pub monitor: Arc<TransportMonitor>,
    pub cache: Arc<RuleCache>,
    pub batcher: Arc<LogBatcher>,
    pub inspection: Option<PacketInspection>,
    pub traffic: Option<Arc<TrafficTracker>>,
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub settings: TunnelSettings,
    pub self_app: TunnelApp,
    pub drain_backoff: Duration,
    pub flush_interval: Duration,
}

impl TunnelOptions {
    pub fn from_config(config: &Config, self_uid: Uid) -> Self {
        Self {
            settings: config.tunnel.clone(),
            self_app: TunnelApp {
                identifier: config.self_identifier.clone(),
                uid: self_uid,
            },
            drain_backoff: config.drain_backoff(),
            flush_interval: config.log_flush_interval(),
        }
    }
}

struct Session {
    running: Arc<AtomicBool>,
    interface: Arc<dyn TunnelInterface>,
    drain: JoinHandle<()>,
    inspector: Option<JoinHandle<()>>,
    ticker: JoinHandle<()>,
    config: TunnelConfig,
}

struct ManagerInner {
    deps: TunnelDeps,
    options: TunnelOptions,
    state: watch::Sender<TunnelState>,
    blocks: broadcast::Sender<PacketDecision>,
    session: Mutex<Option<Session>>,
}

#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<ManagerInner>,
}

impl TunnelManager {
    pub fn new(deps: TunnelDeps, options: TunnelOptions) -> Self {
        let (state, _) = watch::channel(TunnelState::Disconnected);
        let (blocks, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                deps,
                options,
                state,
                blocks,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    /// Block decisions made on the drain path
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<PacketDecision> {
        self.inner.blocks.subscribe()
    }

    pub fn cache(&self) -> &Arc<RuleCache> {
        &self.inner.deps.cache
    }

    pub fn monitor(&self) -> &Arc<TransportMonitor> {
        &self.inner.deps.monitor
    }

    /// Configuration of the running tunnel
    pub async fn active_config(&self) -> Option<TunnelConfig> {
        self.inner.session.lock().await.as_ref().map(|s| s.config.clone())
    }

    fn set_state(&self, state: TunnelState) {
        self.inner.state.send_replace(state);
        debug!("Tunnel state: {}", state);
    }

    /// Bring the tunnel up. Does nothing when already connected.
    ///
    /// On failure the state becomes `Error`, every subsidiary loop is stopped
    /// and the error is returned. A later `start` may succeed.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        self.set_state(TunnelState::Connecting);
        match self.bring_up().await {
            Ok(new_session) => {
                info!(
                    "Tunnel {} connected on {} ({} blocked, {} bypassed)",
                    new_session.config.name,
                    new_session.config.transport,
                    new_session.config.blocked.len(),
                    new_session.config.bypass.len()
                );
                *session = Some(new_session);
                self.set_state(TunnelState::Connected);
                Ok(())
            }
            Err(e) => {
                error!("Failed to establish tunnel: {}", e);
                self.release_subsidiaries();
                self.set_state(TunnelState::Error);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<Session> {
        let deps = &self.inner.deps;
        let options = &self.inner.options;

        deps.monitor.start_monitoring();
        if let Some(traffic) = &deps.traffic {
            traffic.start();
        }
        let transport = deps.monitor.current_transport();

        let rules = deps.rules.clone();
        let registry = deps.registry.clone();
        let (blocked_rules, installed) = tokio::task::spawn_blocking(move || {
            Ok::<_, NetwardenError>((rules.blocked_rules()?, registry.installed_apps()?))
        })
        .await??;

        let blocked = blocked_set(&blocked_rules, transport);
        let config = TunnelConfig::plan(
            &options.settings,
            transport,
            blocked,
            &installed,
            &options.self_app,
        )?;

        let packages: HashMap<Uid, String> = installed
            .iter()
            .map(|app| (app.uid, app.identifier.clone()))
            .collect();
        deps.cache.preload_with(&packages, &blocked_rules);

        let builder = deps.builder.clone();
        let establish_config = config.clone();
        let interface = tokio::task::spawn_blocking(move || builder.establish(&establish_config))
            .await??;

        let (queue, inspector) = match &deps.inspection {
            Some(inspection) => {
                let (queue, pending) = mpsc::channel(INSPECTION_QUEUE);
                let worker = tokio::spawn(inspect_worker(
                    inspection.classifier.clone(),
                    inspection.resolver.clone(),
                    self.inner.blocks.clone(),
                    pending,
                ));
                (Some(queue), Some(worker))
            }
            None => (None, None),
        };

        let running = Arc::new(AtomicBool::new(true));
        let drain = tokio::spawn(drain_loop(
            Arc::downgrade(&self.inner),
            interface.clone(),
            running.clone(),
            usize::from(config.mtu),
            queue,
        ));
        let ticker = tokio::spawn(flush_ticker(
            deps.batcher.clone(),
            options.flush_interval,
            running.clone(),
        ));

        Ok(Session {
            running,
            interface,
            drain,
            inspector,
            ticker,
            config,
        })
    }

    /// Tear everything down. Safe to call in any state, any number of times.
    pub async fn stop(&self) {
        let mut session = self.inner.session.lock().await;
        let current = session.take();

        if let Some(current) = &current {
            current.running.store(false, Ordering::Release);
            current.ticker.abort();
        }
        if let Some(current) = current {
            if let Err(e) = current.drain.await {
                if !e.is_cancelled() {
                    warn!("Drain task ended abnormally: {}", e);
                }
            }
            // the drain held the only queue sender, so the worker finishes the backlog and exits
            if let Some(inspector) = current.inspector {
                if let Err(e) = inspector.await {
                    warn!("Inspection worker ended abnormally: {}", e);
                }
            }
            self.release_subsidiaries();
            current.interface.close();
            info!("Tunnel {} closed", current.config.name);
        } else {
            self.release_subsidiaries();
        }
        self.inner.deps.batcher.sync().await;

        self.set_state(TunnelState::Disconnected);
    }

    /// The OS took the tunnel away; same teardown as `stop`
    pub async fn revoke(&self) {
        warn!("Tunnel permission revoked");
        self.stop().await;
    }

    /// Rebuild the tunnel so it reflects current rules and transport
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    fn release_subsidiaries(&self) {
        let deps = &self.inner.deps;
        deps.batcher.force_flush();
        deps.cache.clear();
        deps.monitor.stop_monitoring();
        if let Some(traffic) = &deps.traffic {
            traffic.stop();
        }
    }
}

async fn drain_loop(
    manager: Weak<ManagerInner>,
    interface: Arc<dyn TunnelInterface>,
    running: Arc<AtomicBool>,
    mtu: usize,
    queue: Option<mpsc::Sender<Vec<u8>>>,
) {
    let mut buf = vec![0u8; mtu.max(1)];
    let mut dropped: u64 = 0;
    let backoff = match manager.upgrade() {
        Some(inner) => inner.options.drain_backoff,
        None => return,
    };

    while running.load(Ordering::Acquire) {
        match interface.read_packet(&mut buf) {
            Ok(0) => tokio::time::sleep(backoff).await,
            Ok(n) => {
                if let Some(queue) = &queue {
                    if let Err(TrySendError::Full(_)) = queue.try_send(buf[..n].to_vec()) {
                        dropped += 1;
                        if dropped.is_power_of_two() {
                            debug!("Inspection queue full; {} packets discarded uninspected", dropped);
                        }
                    }
                }
                tokio::task::yield_now().await;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => tokio::time::sleep(backoff).await,
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                running.store(false, Ordering::Release);
                if let Some(inner) = manager.upgrade() {
                    let manager = TunnelManager { inner };
                    tokio::spawn(async move { manager.revoke().await });
                }
                break;
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    warn!("Tunnel read failed: {}", e);
                }
                tokio::task::yield_now().await;
            }
        }
    }
    debug!("Drain loop finished");
}

async fn inspect_worker(
    classifier: Arc<PacketClassifier>,
    resolver: Arc<dyn FlowOwnerResolver>,
    blocks: broadcast::Sender<PacketDecision>,
    mut pending: mpsc::Receiver<Vec<u8>>,
) {
    let mut batch = Vec::with_capacity(INSPECTION_BATCH);
    while pending.recv_many(&mut batch, INSPECTION_BATCH).await > 0 {
        let packets = std::mem::take(&mut batch);
        let classifier = classifier.clone();
        let resolver = resolver.clone();
        let decisions = tokio::task::spawn_blocking(move || {
            packets
                .iter()
                .filter_map(|packet| classifier.classify(packet, resolver.as_ref()))
                .filter(|decision| decision.blocked)
                .collect::<Vec<_>>()
        })
        .await;

        match decisions {
            Ok(decisions) => {
                for decision in decisions {
                    let _ = blocks.send(decision);
                }
            }
            Err(e) => warn!("Packet inspection failed: {}", e),
        }
    }
    debug!("Inspection worker finished");
}

async fn flush_ticker(batcher: Arc<LogBatcher>, period: Duration, running: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    while running.load(Ordering::Acquire) {
        ticker.tick().await;
        batcher.flush_if_due();
    }
}
