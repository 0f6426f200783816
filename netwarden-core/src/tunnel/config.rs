use crate::config::TunnelSettings;
use crate::error::{NetwardenError, Result};
use crate::types::{ApplicationRule, InstalledApp, TransportState, Uid};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Unreachable host routed into the tunnel when nothing is blocked
pub const NULL_ROUTE: Ipv4Addr = Ipv4Addr::new(10, 255, 255, 255);

/// An application excluded from the tunnel
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TunnelApp {
    pub identifier: String,
    pub uid: Uid,
}

/// Everything the platform needs to bring the tunnel up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    pub session_name: String,
    pub mtu: u16,
    pub address_v4: Ipv4Network,
    pub address_v6: Ipv6Network,
    pub routes: Vec<IpNetwork>,
    /// Applications whose traffic never enters the tunnel
    pub bypass: Vec<TunnelApp>,
    pub dns_servers: Vec<IpAddr>,
    pub blocking: bool,
    pub route_table: u32,
    pub rule_priority: u32,
    pub transport: TransportState,
    /// Identifiers whose traffic the tunnel captures
    pub blocked: BTreeSet<String>,
}

impl TunnelConfig {
    /// Route-by-default, bypass-the-allowed.
    ///
    /// With an empty blocked set only the null route is installed so the
    /// tunnel stays up without touching real traffic. This application is
    /// always bypassed. Routing is per uid, so an allowed identifier sharing
    /// a uid with a blocked one is captured along with it.
    pub fn plan(
        settings: &TunnelSettings,
        transport: TransportState,
        blocked: BTreeSet<String>,
        installed: &[InstalledApp],
        self_app: &TunnelApp,
    ) -> Result<Self> {
        let address_v4 = Ipv4Network::new(settings.address_v4, 32).map_err(invalid)?;
        let address_v6 = Ipv6Network::new(settings.address_v6, 128).map_err(invalid)?;

        let mut bypass = BTreeSet::new();
        bypass.insert(self_app.clone());

        let routes = if blocked.is_empty() {
            vec![network(IpAddr::V4(NULL_ROUTE), 32)?]
        } else {
            let blocked_uids: BTreeSet<Uid> = installed
                .iter()
                .filter(|app| blocked.contains(&app.identifier) && app.uid != self_app.uid)
                .map(|app| app.uid)
                .collect();
            for app in installed {
                if !blocked.contains(&app.identifier)
                    && !blocked_uids.contains(&app.uid)
                    && app.identifier != self_app.identifier
                {
                    bypass.insert(TunnelApp {
                        identifier: app.identifier.clone(),
                        uid: app.uid,
                    });
                }
            }
            vec![
                network(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)?,
                network(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)?,
            ]
        };

        Ok(Self {
            name: settings.name.clone(),
            session_name: settings.session_name.clone(),
            mtu: settings.mtu,
            address_v4,
            address_v6,
            routes,
            bypass: bypass.into_iter().collect(),
            dns_servers: settings.dns_servers.clone(),
            blocking: false,
            route_table: settings.route_table,
            rule_priority: settings.rule_priority,
            transport,
            blocked,
        })
    }

    pub fn is_null_routed(&self) -> bool {
        self.blocked.is_empty()
    }

    /// Distinct uids routed around the tunnel
    pub fn bypass_uids(&self) -> BTreeSet<Uid> {
        self.bypass.iter().map(|app| app.uid).collect()
    }
}

/// Identifiers blocked on `transport`. Nothing is blocked without a transport.
pub fn blocked_set(rules: &[ApplicationRule], transport: TransportState) -> BTreeSet<String> {
    rules
        .iter()
        .filter(|rule| rule.blocks_on(transport))
        .map(|rule| rule.identifier.clone())
        .collect()
}

fn network(ip: IpAddr, prefix: u8) -> Result<IpNetwork> {
    IpNetwork::new(ip, prefix).map_err(invalid)
}

fn invalid(e: ipnetwork::IpNetworkError) -> NetwardenError {
    NetwardenError::InvalidConfig(e.to_string())
}
