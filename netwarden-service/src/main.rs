//! Netwarden Service - per-application firewall daemon
//!
//! - TUN device with per-uid policy routing
//! - Wifi/cellular tracking from the default route
//! - Blocked connection logging
//! - Tunnel rebuilt on rule and transport changes

mod connectivity;
mod control;
mod counters;
mod flow;
mod power;
mod tun;

use anyhow::Result;
use clap::Parser;
use colored::*;
use connectivity::SysfsConnectivity;
use control::Supervisor;
use counters::ProcNetDev;
use flow::ProcNetResolver;
use netwarden_core::{
    apps::sync_installed_apps,
    classifier::{PacketClassifier, PacketDecision},
    config::Config,
    database::Database,
    log_batcher::LogBatcher,
    registry::PasswdRegistry,
    rule_cache::RuleCache,
    store::{PowerPolicy, RuleStore},
    traffic::TrafficTracker,
    transport::TransportMonitor,
    tunnel::{PacketInspection, TunnelDeps, TunnelManager, TunnelOptions},
    TunnelState,
};
use power::LinuxPowerPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tun::LinuxTunnelBuilder;

const DEFAULT_FILTER: &str = "netwarden_service=info,netwarden_core=info";
const TRAFFIC_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "netwarden-service")]
#[command(about = "Netwarden per-application firewall daemon", version)]
struct Args {
    /// Config file (defaults to $NETWARDEN_CONFIG, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep the tunnel down unless it was switched on with `netwarden tunnel on`
    #[arg(long)]
    no_start: bool,
}

fn print_banner() {
    println!();
    println!("{}", "╔═══════════════════════════════════════════════════════════════╗".cyan());
    println!("{}", "║                      NETWARDEN FIREWALL                       ║".cyan());
    println!("{}", "║               Per-Application Wifi/Cellular Rules             ║".cyan());
    println!("{}", "╚═══════════════════════════════════════════════════════════════╝".cyan());
    println!();
}

fn print_block(decision: &PacketDecision, name: Option<(String, String)>) {
    let action = format!(" {:^7} ", "BLOCK").on_red().white().bold();
    let app = match name {
        Some((identifier, display_name)) if identifier != display_name => {
            format!("{} {}", display_name.white().bold(), format!("({})", identifier).dimmed())
        }
        Some((identifier, _)) => identifier.white().bold().to_string(),
        None => format!("uid {}", decision.uid).white().bold().to_string(),
    };
    println!(
        "{}│ {} → {}:{} {}",
        action,
        app,
        decision.destination.yellow(),
        decision.port.to_string().cyan(),
        format!("[{}]", decision.transport).dimmed()
    );
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
        _ = terminate => {}
    }
    println!();
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with_target(false)
        .init();

    print_banner();

    let config = Config::load(args.config.as_deref())?;
    config.validate()?;

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    println!("{} {}", "Database:".dimmed(), db_path.display());
    let db = Database::open(&db_path)?;

    let registry = Arc::new(PasswdRegistry::from_config(&config));
    match sync_installed_apps(&db, registry.as_ref(), &config.self_identifier, config.prune_uninstalled) {
        Ok(report) => println!(
            "{} {} installed, {} new, {} updated, {} pruned",
            "Apps:".dimmed(),
            report.installed,
            report.created,
            report.updated,
            report.pruned
        ),
        Err(e) => warn!("Application sync failed: {}", e),
    }
    println!(
        "{} {} applications with a block rule",
        "Rules:".dimmed(),
        db.blocked_app_count().unwrap_or(0)
    );

    if LinuxPowerPolicy.would_kill_background_service() {
        warn!("Power management may stop this service");
    }

    let store = Arc::new(db.clone());
    let cache = Arc::new(RuleCache::new(store.clone(), config.cache_capacity));
    let provider = Arc::new(SysfsConnectivity::new(&config.tunnel.name, config.network_poll_interval()));
    let monitor = Arc::new(TransportMonitor::new(provider));
    let batcher = Arc::new(LogBatcher::new(
        store.clone(),
        config.log_batch_size,
        config.log_flush_interval(),
    ));
    let classifier = Arc::new(PacketClassifier::new(cache.clone(), monitor.clone()).with_batcher(batcher.clone()));
    let traffic = Arc::new(TrafficTracker::new(Arc::new(ProcNetDev::new(&config.tunnel.name))));

    let deps = TunnelDeps {
        rules: store,
        registry,
        builder: Arc::new(LinuxTunnelBuilder),
        monitor,
        cache: cache.clone(),
        batcher,
        inspection: Some(PacketInspection {
            classifier,
            resolver: Arc::new(ProcNetResolver::new()),
        }),
        traffic: Some(traffic.clone()),
    };
    // SAFETY: geteuid has no preconditions
    let self_uid = unsafe { libc::geteuid() };
    let manager = TunnelManager::new(deps, TunnelOptions::from_config(&config, self_uid));

    println!(
        "{} {} ({}, bypassing uid {})",
        "Tunnel:".dimmed(),
        config.tunnel.name,
        config.tunnel.session_name,
        self_uid
    );
    println!();
    println!("{}", "Monitoring blocked connections... (Ctrl+C to stop)".green());
    println!("{}", "─".repeat(65).dimmed());

    let mut blocks = manager.subscribe_blocks();
    tokio::spawn(async move {
        loop {
            match blocks.recv().await {
                Ok(decision) => print_block(&decision, cache.describe(decision.uid)),
                Err(RecvError::Lagged(skipped)) => warn!("Console skipped {} blocked connections", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let reporter = manager.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TRAFFIC_REPORT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if reporter.state() == TunnelState::Connected {
                let sample = traffic.current();
                info!(
                    "Traffic ↓ {} ↑ {} (totals {} / {} bytes)",
                    sample.download_speed_formatted(),
                    sample.upload_speed_formatted(),
                    sample.total_download,
                    sample.total_upload
                );
            }
        }
    });

    let supervisor = Supervisor::new(
        manager,
        db,
        config.auto_start && !args.no_start,
        config.rules_poll_interval(),
        config.log_retention_days,
    );
    supervisor.run(shutdown_signal()).await;

    info!("Netwarden service stopped");
    Ok(())
}
