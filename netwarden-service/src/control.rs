//! Keeps the tunnel in line with what the user asked for.
//!
//! The CLI edits rules and the on/off switch in the database. The supervisor
//! polls for those edits, watches the transport, and starts, stops or rebuilds
//! the tunnel accordingly.

use netwarden_core::database::Database;
use netwarden_core::store::{LogStore, RuleStore};
use netwarden_core::tunnel::TunnelManager;
use netwarden_core::{TransportState, TunnelState};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Nothing,
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub desired: bool,
    pub state: TunnelState,
    pub rules_changed: bool,
    pub transport_changed: bool,
    /// The user flipped the switch since the last look
    pub requested: bool,
}

/// An `Error` tunnel is only retried when something changed
pub fn decide(obs: &Observation) -> Action {
    let stale = obs.rules_changed || obs.transport_changed;
    match (obs.desired, obs.state) {
        (false, TunnelState::Disconnected) => Action::Nothing,
        (false, _) => Action::Stop,
        (true, TunnelState::Disconnected) => Action::Start,
        (true, TunnelState::Error) if stale || obs.requested => Action::Start,
        (true, TunnelState::Connected) if stale => Action::Restart,
        _ => Action::Nothing,
    }
}

pub struct Supervisor {
    manager: TunnelManager,
    db: Database,
    auto_start: bool,
    poll_interval: Duration,
    retention_days: u32,
    revision: i64,
    requests: i64,
    /// Set while a session started here is expected to be up
    owns_session: bool,
}

impl Supervisor {
    pub fn new(manager: TunnelManager, db: Database, auto_start: bool, poll_interval: Duration, retention_days: u32) -> Self {
        let revision = db.rules_revision().unwrap_or_default();
        let requests = db.tunnel_requests().unwrap_or_default();
        Self {
            manager,
            db,
            auto_start,
            poll_interval,
            retention_days,
            revision,
            requests,
            owns_session: false,
        }
    }

    /// Drive the tunnel until `shutdown` resolves, then stop it
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut transport = self.manager.monitor().subscribe();
        let mut state = self.manager.subscribe_state();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = poll.tick() => {
                    self.tick().await;
                }
                Ok(()) = transport.changed() => {
                    let current = *transport.borrow_and_update();
                    self.record_transport(current);
                    self.tick().await;
                }
                Ok(()) = state.changed() => {
                    let current = *state.borrow_and_update();
                    self.record_state(current);
                }
                _ = prune.tick() => self.prune(),
            }
        }

        info!("Shutting down tunnel");
        self.manager.stop().await;
        self.record_state(TunnelState::Disconnected);
    }

    /// Observe, decide and act once
    pub async fn tick(&mut self) -> Action {
        let state = self.manager.state();
        if self.owns_session && state == TunnelState::Disconnected {
            // torn down by revocation rather than by us
            warn!("Tunnel was revoked; staying off until re-enabled");
            self.owns_session = false;
            if let Err(e) = self.db.set_tunnel_enabled(false) {
                warn!("Failed to record tunnel revocation: {}", e);
            }
        }

        let desired = match self.db.tunnel_enabled() {
            Ok(enabled) => enabled.unwrap_or(self.auto_start),
            Err(e) => {
                warn!("Failed to read tunnel switch: {}", e);
                return Action::Nothing;
            }
        };
        let revision = self.db.rules_revision().unwrap_or(self.revision);
        let requests = self.db.tunnel_requests().unwrap_or(self.requests);
        let active = self.manager.active_config().await.map(|config| config.transport);
        let current = self.manager.monitor().current_transport();

        let obs = Observation {
            desired,
            state,
            rules_changed: revision != self.revision,
            transport_changed: active.is_some_and(|t| t != current),
            requested: requests != self.requests,
        };
        self.revision = revision;
        self.requests = requests;

        let action = decide(&obs);
        debug!("Supervisor {:?} -> {:?}", obs, action);
        match action {
            Action::Nothing => {}
            Action::Start => {
                info!("Starting tunnel");
                self.owns_session = self.manager.start().await.is_ok();
            }
            Action::Restart => {
                info!(
                    "Rebuilding tunnel (rules changed: {}, transport changed: {})",
                    obs.rules_changed, obs.transport_changed
                );
                self.owns_session = self.manager.restart().await.is_ok();
            }
            Action::Stop => {
                info!("Stopping tunnel");
                self.owns_session = false;
                self.manager.stop().await;
            }
        }
        action
    }

    fn prune(&self) {
        match self.db.prune_older_than_days(self.retention_days) {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} connection logs older than {} days", n, self.retention_days),
            Err(e) => warn!("Log pruning failed: {}", e),
        }
    }

    fn record_state(&self, state: TunnelState) {
        if let Err(e) = self.db.set_tunnel_state(state) {
            warn!("Failed to record tunnel state: {}", e);
        }
    }

    fn record_transport(&self, transport: TransportState) {
        if let Err(e) = self.db.set_transport(transport) {
            warn!("Failed to record transport: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netwarden_core::classifier::{FlowOwnerResolver, PacketClassifier};
    use netwarden_core::config::Config;
    use netwarden_core::log_batcher::LogBatcher;
    use netwarden_core::rule_cache::RuleCache;
    use netwarden_core::store::AppRegistry;
    use netwarden_core::transport::{
        ConnectivityProvider, NetworkCallback, TransportCapabilities, TransportMonitor,
    };
    use netwarden_core::tunnel::{
        PacketInspection, TunnelBuilder, TunnelConfig, TunnelDeps, TunnelInterface, TunnelOptions,
    };
    use netwarden_core::{ApplicationRule, InstalledApp, NetwardenError, Result, Uid};
    use parking_lot::Mutex;
    use std::io;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn obs(desired: bool, state: TunnelState) -> Observation {
        Observation {
            desired,
            state,
            rules_changed: false,
            transport_changed: false,
            requested: false,
        }
    }

    #[test]
    fn test_decide_follows_switch() {
        assert_eq!(decide(&obs(true, TunnelState::Disconnected)), Action::Start);
        assert_eq!(decide(&obs(true, TunnelState::Connected)), Action::Nothing);
        assert_eq!(decide(&obs(false, TunnelState::Connected)), Action::Stop);
        assert_eq!(decide(&obs(false, TunnelState::Error)), Action::Stop);
        assert_eq!(decide(&obs(false, TunnelState::Disconnected)), Action::Nothing);
    }

    #[test]
    fn test_decide_rebuilds_on_changes() {
        let mut rules = obs(true, TunnelState::Connected);
        rules.rules_changed = true;
        assert_eq!(decide(&rules), Action::Restart);

        let mut transport = obs(true, TunnelState::Connected);
        transport.transport_changed = true;
        assert_eq!(decide(&transport), Action::Restart);

        // re-enabling a running tunnel changes nothing
        let mut request = obs(true, TunnelState::Connected);
        request.requested = true;
        assert_eq!(decide(&request), Action::Nothing);
    }

    #[test]
    fn test_decide_retries_error_only_on_change() {
        assert_eq!(decide(&obs(true, TunnelState::Error)), Action::Nothing);

        let mut rules = obs(true, TunnelState::Error);
        rules.rules_changed = true;
        assert_eq!(decide(&rules), Action::Start);

        let mut request = obs(true, TunnelState::Error);
        request.requested = true;
        assert_eq!(decide(&request), Action::Start);
    }

    struct Wifi;

    impl ConnectivityProvider for Wifi {
        fn active_network(&self) -> Option<TransportCapabilities> {
            Some(TransportCapabilities {
                wifi: true,
                internet: true,
                ..Default::default()
            })
        }

        fn register(&self, _callback: NetworkCallback) -> Result<()> {
            Ok(())
        }

        fn unregister(&self) {}
    }

    struct Apps;

    impl AppRegistry for Apps {
        fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
            Ok(vec![InstalledApp {
                identifier: "alice".into(),
                display_name: "Alice".into(),
                uid: 1000,
                is_system: false,
            }])
        }
    }

    #[derive(Default)]
    struct Idle {
        gone: AtomicBool,
    }

    impl TunnelInterface for Idle {
        fn read_packet(&self, _buf: &mut [u8]) -> io::Result<usize> {
            if self.gone.load(Ordering::SeqCst) {
                Err(io::ErrorKind::NotConnected.into())
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            }
        }

        fn close(&self) {}
    }

    #[derive(Default)]
    struct Recorder {
        fail: AtomicBool,
        configs: Mutex<Vec<TunnelConfig>>,
        interfaces: Mutex<Vec<Arc<Idle>>>,
    }

    impl TunnelBuilder for Recorder {
        fn establish(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelInterface>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(NetwardenError::Establish("refused".into()));
            }
            self.configs.lock().push(config.clone());
            let interface = Arc::new(Idle::default());
            self.interfaces.lock().push(interface.clone());
            Ok(interface)
        }
    }

    fn supervisor(db: &Database, builder: Arc<Recorder>) -> Supervisor {
        let store = Arc::new(db.clone());
        let cache = Arc::new(RuleCache::new(store.clone(), 16));
        let monitor = Arc::new(TransportMonitor::new(Arc::new(Wifi)));
        let batcher = Arc::new(LogBatcher::with_defaults(store.clone()));
        let resolver: Arc<dyn FlowOwnerResolver> =
            Arc::new(|_: IpAddr, _: u16, _: u8| -> Option<Uid> { None });
        let classifier = Arc::new(PacketClassifier::new(cache.clone(), monitor.clone()));
        let deps = TunnelDeps {
            rules: store,
            registry: Arc::new(Apps),
            builder,
            monitor,
            cache,
            batcher,
            inspection: Some(PacketInspection { classifier, resolver }),
            traffic: None,
        };
        let manager = TunnelManager::new(deps, TunnelOptions::from_config(&Config::default(), 990));
        Supervisor::new(manager, db.clone(), true, Duration::from_secs(2), 7)
    }

    #[tokio::test]
    async fn test_supervisor_starts_rebuilds_and_stops() {
        let db = Database::in_memory().unwrap();
        db.upsert_rule(&ApplicationRule::new("alice", "Alice", false)).unwrap();
        let builder = Arc::new(Recorder::default());
        let mut supervisor = supervisor(&db, builder.clone());

        assert_eq!(supervisor.tick().await, Action::Start);
        assert_eq!(supervisor.manager.state(), TunnelState::Connected);
        assert!(builder.configs.lock()[0].is_null_routed());

        assert_eq!(supervisor.tick().await, Action::Nothing);

        db.update_rule("alice", true, false).unwrap();
        assert_eq!(supervisor.tick().await, Action::Restart);
        let configs = builder.configs.lock().clone();
        assert_eq!(configs.len(), 2);
        assert!(configs[1].blocked.contains("alice"));

        db.set_tunnel_enabled(false).unwrap();
        assert_eq!(supervisor.tick().await, Action::Stop);
        assert_eq!(supervisor.manager.state(), TunnelState::Disconnected);
        assert_eq!(supervisor.tick().await, Action::Nothing);
    }

    #[tokio::test]
    async fn test_failed_start_waits_for_a_change() {
        let db = Database::in_memory().unwrap();
        let builder = Arc::new(Recorder::default());
        builder.fail.store(true, Ordering::SeqCst);
        let mut supervisor = supervisor(&db, builder.clone());

        assert_eq!(supervisor.tick().await, Action::Start);
        assert_eq!(supervisor.manager.state(), TunnelState::Error);
        assert_eq!(supervisor.tick().await, Action::Nothing);

        builder.fail.store(false, Ordering::SeqCst);
        db.set_tunnel_enabled(true).unwrap();
        assert_eq!(supervisor.tick().await, Action::Start);
        assert_eq!(supervisor.manager.state(), TunnelState::Connected);

        supervisor.manager.stop().await;
    }

    #[tokio::test]
    async fn test_revocation_turns_the_switch_off() {
        let db = Database::in_memory().unwrap();
        let builder = Arc::new(Recorder::default());
        let mut supervisor = supervisor(&db, builder.clone());

        assert_eq!(supervisor.tick().await, Action::Start);
        let mut state = supervisor.manager.subscribe_state();
        builder.interfaces.lock()[0].gone.store(true, Ordering::SeqCst);
        state.wait_for(|s| *s == TunnelState::Disconnected).await.unwrap();

        assert_eq!(supervisor.tick().await, Action::Nothing);
        assert_eq!(db.tunnel_enabled().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_run_records_state_and_stops_on_shutdown() {
        let db = Database::in_memory().unwrap();
        let builder = Arc::new(Recorder::default());
        let supervisor = supervisor(&db, builder.clone());
        let manager = supervisor.manager.clone();

        let recorded = db.clone();
        let shutdown = async move {
            while recorded.tunnel_state().unwrap() != TunnelState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), supervisor.run(shutdown))
            .await
            .unwrap();

        assert_eq!(builder.configs.lock().len(), 1);
        assert_eq!(manager.state(), TunnelState::Disconnected);
        assert_eq!(db.tunnel_state().unwrap(), TunnelState::Disconnected);
    }
}
