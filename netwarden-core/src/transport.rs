//! Network transport monitor.
//!
//! Tracks which transport carries traffic. Reads are a single atomic load so
//! the packet path can call [`TransportMonitor::current_transport`] freely.

use crate::error::Result;
use crate::types::TransportState;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Capabilities of a network as reported by the OS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCapabilities {
    pub cellular: bool,
    pub wifi: bool,
    pub ethernet: bool,
    pub internet: bool,
}

impl TransportCapabilities {
    /// Cellular wins over wifi; ethernet counts as wifi
    pub fn classify(&self) -> TransportState {
        if !self.internet {
            TransportState::None
        } else if self.cellular {
            TransportState::Cellular
        } else if self.wifi || self.ethernet {
            TransportState::Wifi
        } else {
            TransportState::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(TransportCapabilities),
    CapabilitiesChanged(TransportCapabilities),
    Lost,
}

pub type NetworkCallback = Arc<dyn Fn(NetworkEvent) + Send + Sync>;

/// OS connectivity subsystem
pub trait ConnectivityProvider: Send + Sync {
    /// Capabilities of the current default network, if any
    fn active_network(&self) -> Option<TransportCapabilities>;

    fn register(&self, callback: NetworkCallback) -> Result<()>;

    fn unregister(&self);
}

struct MonitorShared {
    current: AtomicU8,
    listening: AtomicBool,
    tx: watch::Sender<TransportState>,
}

impl MonitorShared {
    fn publish(&self, state: TransportState) {
        self.current.store(state as u8, Ordering::Release);
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("Transport changed to {}", state);
        }
    }

    fn handle(&self, provider: &Weak<dyn ConnectivityProvider>, event: NetworkEvent) {
        if !self.listening.load(Ordering::Acquire) {
            return;
        }
        let state = match event {
            NetworkEvent::Available(caps) | NetworkEvent::CapabilitiesChanged(caps) => caps.classify(),
            NetworkEvent::Lost => {
                // another network may already be up
                provider
                    .upgrade()
                    .and_then(|p| p.active_network())
                    .map(|caps| caps.classify())
                    .unwrap_or(TransportState::None)
            }
        };
        debug!("Network event {:?} -> {}", event, state);
        self.publish(state);
    }
}

pub struct TransportMonitor {
    provider: Arc<dyn ConnectivityProvider>,
    shared: Arc<MonitorShared>,
    running: Mutex<bool>,
}

impl TransportMonitor {
    pub fn new(provider: Arc<dyn ConnectivityProvider>) -> Self {
        let (tx, _) = watch::channel(TransportState::None);
        Self {
            provider,
            shared: Arc::new(MonitorShared {
                current: AtomicU8::new(TransportState::None as u8),
                listening: AtomicBool::new(false),
                tx,
            }),
            running: Mutex::new(false),
        }
    }

    /// Register for connectivity events and sample the active network.
    /// A second call while running does nothing.
    pub fn start_monitoring(&self) {
        let mut running = self.running.lock();
        if *running {
            return;
        }
        *running = true;

        self.shared.publish(TransportState::None);
        self.shared.listening.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let provider = Arc::downgrade(&self.provider);
        let callback: NetworkCallback = Arc::new(move |event: NetworkEvent| shared.handle(&provider, event));
        if let Err(e) = self.provider.register(callback) {
            warn!("Failed to register for network events: {}", e);
        }

        self.refresh();
    }

    /// Unregister; the last value stays readable
    pub fn stop_monitoring(&self) {
        let mut running = self.running.lock();
        if !*running {
            return;
        }
        *running = false;
        self.shared.listening.store(false, Ordering::Release);
        self.provider.unregister();
        debug!("Transport monitoring stopped at {}", self.current_transport());
    }

    /// Re-sample the active network
    pub fn refresh(&self) {
        if !self.shared.listening.load(Ordering::Acquire) {
            return;
        }
        let state = self
            .provider
            .active_network()
            .map(|caps| caps.classify())
            .unwrap_or(TransportState::None);
        self.shared.publish(state);
    }

    pub fn current_transport(&self) -> TransportState {
        TransportState::from_u8(self.shared.current.load(Ordering::Acquire))
    }

    /// Stream of transitions
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.shared.tx.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        *self.running.lock()
    }
}
