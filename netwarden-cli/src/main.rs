use anyhow::{anyhow, Result};
use chrono::{Local, TimeZone, Utc};
use clap::{Parser, Subcommand};
use netwarden_core::{
    apps::{sync_installed_apps, AppListing, RuleEditor, SortOrder},
    classifier::{parse_header, PacketClassifier, PROTO_TCP, PROTO_UDP},
    config::Config,
    database::Database,
    registry::PasswdRegistry,
    rule_cache::RuleCache,
    store::{AppRegistry, LogStore, RuleStore},
    transport::{ConnectivityProvider, NetworkCallback, TransportCapabilities, TransportMonitor},
    TransportState, Uid,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "netwarden")]
#[command(about = "Netwarden per-application firewall", version)]
struct Cli {
    /// Config file (defaults to $NETWARDEN_CONFIG, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file path, overriding the config
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List applications and their rules
    Apps {
        /// Filter by name or identifier
        #[arg(short, long)]
        search: Option<String>,
        /// Hide system accounts
        #[arg(long)]
        hide_system: bool,
        /// Sort order (name, blocked-first, system-last)
        #[arg(long, default_value = "name")]
        sort: SortOrder,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Block an application (both networks unless one is given)
    Block {
        identifier: String,
        #[arg(long)]
        wifi: bool,
        #[arg(long)]
        cellular: bool,
    },
    /// Unblock an application (both networks unless one is given)
    Unblock {
        identifier: String,
        #[arg(long)]
        wifi: bool,
        #[arg(long)]
        cellular: bool,
    },
    /// Flip one network's rule for an application
    Toggle {
        identifier: String,
        /// Network to toggle (wifi or cellular)
        #[arg(long, default_value = "wifi")]
        network: TransportState,
    },
    /// Block every application
    BlockAll {
        #[arg(long)]
        wifi: bool,
        #[arg(long)]
        cellular: bool,
    },
    /// Unblock every application
    UnblockAll {
        #[arg(long)]
        wifi: bool,
        #[arg(long)]
        cellular: bool,
    },
    /// Reconcile rules with installed applications
    Sync,
    /// View blocked connection history
    Logs {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only show records for this application
        #[arg(long)]
        app: Option<String>,
        #[command(subcommand)]
        action: Option<LogsAction>,
    },
    /// Show tunnel and rule status
    Status,
    /// Switch the tunnel on or off
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
    /// Classify a raw IP packet against the current rules (for testing)
    Classify {
        /// Packet bytes as hex
        packet: String,
        /// Uid owning the flow
        #[arg(long)]
        uid: Option<Uid>,
        /// Transport to decide under
        #[arg(long, default_value = "wifi")]
        transport: TransportState,
    },
}

#[derive(Subcommand)]
enum LogsAction {
    /// Delete every record
    Clear,
    /// Delete records older than the retention window
    Prune {
        /// Days to keep (defaults to the configured retention)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum TunnelAction {
    On,
    Off,
}

#[derive(Tabled)]
struct AppRow {
    #[tabled(rename = "Identifier")]
    identifier: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "UID")]
    uid: String,
    #[tabled(rename = "Wifi")]
    wifi: String,
    #[tabled(rename = "Cellular")]
    cellular: String,
    #[tabled(rename = "Type")]
    kind: String,
}

#[derive(Tabled)]
struct LogRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Application")]
    application: String,
    #[tabled(rename = "Destination")]
    destination: String,
    #[tabled(rename = "Network")]
    network: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt::init();

    let config = Config::load(cli.config.as_deref())?;
    let db_path = cli.database.clone().unwrap_or_else(|| config.database_path());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&db_path)?;

    match cli.command {
        Commands::Apps {
            search,
            hide_system,
            sort,
            json,
        } => handle_apps(&db, &config, search, hide_system, sort, json)?,
        Commands::Block {
            identifier,
            wifi,
            cellular,
        } => handle_set(&db, &identifier, true, wifi, cellular)?,
        Commands::Unblock {
            identifier,
            wifi,
            cellular,
        } => handle_set(&db, &identifier, false, wifi, cellular)?,
        Commands::Toggle { identifier, network } => handle_toggle(&db, &identifier, network)?,
        Commands::BlockAll { wifi, cellular } => handle_set_all(&db, true, wifi, cellular)?,
        Commands::UnblockAll { wifi, cellular } => handle_set_all(&db, false, wifi, cellular)?,
        Commands::Sync => handle_sync(&db, &config)?,
        Commands::Logs { limit, app, action } => handle_logs(&db, &config, limit, app, action)?,
        Commands::Status => handle_status(&db)?,
        Commands::Tunnel { action } => handle_tunnel(&db, action)?,
        Commands::Classify {
            packet,
            uid,
            transport,
        } => handle_classify(&db, &config, &packet, uid, transport)?,
    }

    Ok(())
}

fn editor(db: &Database) -> RuleEditor {
    RuleEditor::new(Arc::new(db.clone()))
}

/// Neither flag means both networks
fn networks(wifi: bool, cellular: bool) -> (bool, bool) {
    if wifi || cellular {
        (wifi, cellular)
    } else {
        (true, true)
    }
}

fn state_label(blocked: bool) -> String {
    let label = if blocked { "Blocked" } else { "Allowed" };
    label.to_string()
}

fn handle_apps(
    db: &Database,
    config: &Config,
    search: Option<String>,
    hide_system: bool,
    sort: SortOrder,
    json: bool,
) -> Result<()> {
    let installed = PasswdRegistry::from_config(config).installed_apps()?;
    let rules = db.all_rules()?;

    let mut listing = AppListing::new().hide_system(hide_system).sort(sort);
    if let Some(query) = search {
        listing = listing.search(query);
    }
    let entries = listing.apply(&installed, &rules);

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No applications found. Run 'netwarden sync' first.");
        return Ok(());
    }

    let rows: Vec<AppRow> = entries
        .into_iter()
        .map(|e| AppRow {
            uid: e.uid.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string()),
            wifi: state_label(e.wifi_blocked),
            cellular: state_label(e.cellular_blocked),
            kind: match (e.is_system, e.installed) {
                (_, false) => "Removed",
                (true, true) => "System",
                (false, true) => "User",
            }
            .to_string(),
            identifier: e.identifier,
            name: e.display_name,
        })
        .collect();

    println!("{}", Table::new(rows));
    Ok(())
}

fn handle_set(db: &Database, identifier: &str, block: bool, wifi: bool, cellular: bool) -> Result<()> {
    let rule = db
        .rule(identifier)?
        .ok_or_else(|| anyhow!("Application not found: {}", identifier))?;
    let (wifi, cellular) = networks(wifi, cellular);

    let wifi_blocked = if wifi { block } else { rule.wifi_blocked };
    let cellular_blocked = if cellular { block } else { rule.cellular_blocked };
    editor(db).set_rule(identifier, wifi_blocked, cellular_blocked)?;

    println!(
        "{}: wifi {}, cellular {}",
        rule.display_name,
        state_label(wifi_blocked).to_lowercase(),
        state_label(cellular_blocked).to_lowercase()
    );
    Ok(())
}

fn handle_toggle(db: &Database, identifier: &str, network: TransportState) -> Result<()> {
    let rule = match network {
        TransportState::Wifi => editor(db).toggle_wifi(identifier)?,
        TransportState::Cellular => editor(db).toggle_cellular(identifier)?,
        TransportState::None => return Err(anyhow!("Pick wifi or cellular")),
    };
    println!(
        "{}: wifi {}, cellular {}",
        rule.display_name,
        state_label(rule.wifi_blocked).to_lowercase(),
        state_label(rule.cellular_blocked).to_lowercase()
    );
    Ok(())
}

fn handle_set_all(db: &Database, block: bool, wifi: bool, cellular: bool) -> Result<()> {
    let (wifi, cellular) = networks(wifi, cellular);
    let editor = editor(db);
    let verb = if block { "Blocked" } else { "Unblocked" };

    if wifi {
        let n = editor.set_all_wifi(block)?;
        println!("{} {} applications on wifi", verb, n);
    }
    if cellular {
        let n = editor.set_all_cellular(block)?;
        println!("{} {} applications on cellular", verb, n);
    }
    Ok(())
}

fn handle_sync(db: &Database, config: &Config) -> Result<()> {
    let registry = PasswdRegistry::from_config(config);
    let report = sync_installed_apps(db, &registry, &config.self_identifier, config.prune_uninstalled)?;

    println!("Synced {} installed applications", report.installed);
    println!("  New:     {}", report.created);
    println!("  Updated: {}", report.updated);
    println!("  Pruned:  {}", report.pruned);
    Ok(())
}

fn handle_logs(
    db: &Database,
    config: &Config,
    limit: usize,
    app: Option<String>,
    action: Option<LogsAction>,
) -> Result<()> {
    match action {
        Some(LogsAction::Clear) => {
            let n = db.clear_logs()?;
            println!("Deleted {} records", n);
            return Ok(());
        }
        Some(LogsAction::Prune { days }) => {
            let days = days.unwrap_or(config.log_retention_days);
            let n = db.prune_older_than_days(days)?;
            println!("Deleted {} records older than {} days", n, days);
            return Ok(());
        }
        None => {}
    }

    let records: Vec<_> = match app {
        Some(identifier) => db.logs_for_app(&identifier)?.into_iter().take(limit).collect(),
        None => db.recent_logs(limit)?,
    };
    if records.is_empty() {
        println!("No blocked connections recorded.");
        return Ok(());
    }

    let rows: Vec<LogRow> = records
        .into_iter()
        .map(|r| LogRow {
            time: r
                .timestamp
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            application: r.display_name,
            destination: format!("{}:{}", r.destination, r.port),
            network: r.transport.to_string(),
        })
        .collect();

    println!("{}", Table::new(rows));
    Ok(())
}

fn handle_status(db: &Database) -> Result<()> {
    let midnight = Local::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let switch = match db.tunnel_enabled()? {
        Some(true) => "on",
        Some(false) => "off",
        None => "default",
    };

    println!("Netwarden Status");
    println!("================");
    println!("Tunnel:       {} (switch {})", db.tunnel_state()?, switch);
    println!("Transport:    {}", db.transport()?);
    println!("Rules:        {} total, {} blocking", db.all_rules()?.len(), db.blocked_app_count()?);
    println!(
        "Blocked:      {} total, {} today",
        db.blocked_connection_count()?,
        db.blocked_connection_count_since(midnight)?
    );
    Ok(())
}

fn handle_tunnel(db: &Database, action: TunnelAction) -> Result<()> {
    let enabled = matches!(action, TunnelAction::On);
    db.set_tunnel_enabled(enabled)?;
    println!(
        "Tunnel switched {}; the service applies it within a few seconds",
        if enabled { "on" } else { "off" }
    );
    Ok(())
}

/// Reports a fixed transport so a decision can be made without the service
struct FixedTransport(TransportState);

impl ConnectivityProvider for FixedTransport {
    fn active_network(&self) -> Option<TransportCapabilities> {
        let caps = match self.0 {
            TransportState::Wifi => TransportCapabilities {
                wifi: true,
                internet: true,
                ..Default::default()
            },
            TransportState::Cellular => TransportCapabilities {
                cellular: true,
                internet: true,
                ..Default::default()
            },
            TransportState::None => return None,
        };
        Some(caps)
    }

    fn register(&self, _callback: NetworkCallback) -> netwarden_core::Result<()> {
        Ok(())
    }

    fn unregister(&self) {}
}

fn handle_classify(
    db: &Database,
    config: &Config,
    packet: &str,
    uid: Option<Uid>,
    transport: TransportState,
) -> Result<()> {
    let bytes = parse_hex(packet)?;
    let header = parse_header(&bytes).ok_or_else(|| anyhow!("Not a complete IPv4 or IPv6 header"))?;

    println!("Simulating packet:");
    println!("  Version:     IPv{}", header.version);
    println!("  Protocol:    {}", protocol_name(header.protocol));
    println!("  Destination: {}:{}", header.destination_text(), header.port);
    println!("  Transport:   {}", transport);
    println!();

    let installed = PasswdRegistry::from_config(config).installed_apps()?;
    let packages: HashMap<Uid, String> = installed
        .into_iter()
        .map(|app| (app.uid, app.identifier))
        .collect();

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let decision = runtime.block_on(async {
        let store = Arc::new(db.clone());
        let cache = Arc::new(RuleCache::new(store, config.cache_capacity));
        cache.preload(&packages).await?;
        let monitor = Arc::new(TransportMonitor::new(Arc::new(FixedTransport(transport))));
        monitor.start_monitoring();

        let classifier = PacketClassifier::new(cache.clone(), monitor.clone());
        let resolver = move |_: IpAddr, _: u16, _: u8| -> Option<Uid> { uid };
        let decision = classifier.classify(&bytes, &resolver);
        monitor.stop_monitoring();
        Ok::<_, netwarden_core::NetwardenError>(decision.map(|d| {
            let name = cache.describe(d.uid);
            (d, name)
        }))
    })?;

    match decision {
        Some((decision, name)) => {
            let app = name
                .map(|(identifier, display_name)| format!("{} ({})", display_name, identifier))
                .unwrap_or_else(|| format!("uid {}", decision.uid));
            let verdict = if decision.blocked { "BLOCK" } else { "ALLOW" };
            println!("Result: {} ({} on {})", verdict, app, decision.transport);
        }
        None => println!("Result: ALLOW (no owning application)"),
    }
    Ok(())
}

fn protocol_name(protocol: u8) -> String {
    match protocol {
        PROTO_TCP => "TCP".to_string(),
        PROTO_UDP => "UDP".to_string(),
        other => other.to_string(),
    }
}

/// Accepts plain hex with optional whitespace, `:` or `-` separators
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if digits.len() % 2 != 0 {
        return Err(anyhow!("Odd number of hex digits"));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| anyhow!("Invalid hex at offset {}", i))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_accepts_separators() {
        assert_eq!(parse_hex("45 00:0a-ff").unwrap(), vec![0x45, 0x00, 0x0a, 0xff]);
        assert_eq!(parse_hex("0x4500").unwrap(), vec![0x45, 0x00]);
        assert!(parse_hex("450").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_networks_default_to_both() {
        assert_eq!(networks(false, false), (true, true));
        assert_eq!(networks(true, false), (true, false));
        assert_eq!(networks(false, true), (false, true));
    }

    #[test]
    fn test_block_preserves_other_network() {
        let db = Database::in_memory().unwrap();
        let mut rule = netwarden_core::ApplicationRule::new("alice", "Alice", false);
        rule.cellular_blocked = true;
        db.upsert_rule(&rule).unwrap();

        handle_set(&db, "alice", true, true, false).unwrap();
        let rule = db.rule("alice").unwrap().unwrap();
        assert!(rule.wifi_blocked && rule.cellular_blocked);

        handle_set(&db, "alice", false, false, false).unwrap();
        let rule = db.rule("alice").unwrap().unwrap();
        assert!(!rule.wifi_blocked && !rule.cellular_blocked);

        assert!(handle_set(&db, "bob", true, false, false).is_err());
    }
}
