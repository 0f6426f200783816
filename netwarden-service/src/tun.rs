//! TUN device and policy routing.
//!
//! The device gets the tunnel addresses and MTU and is read in non-blocking
//! mode. Steering is done with a dedicated routing table: a catch-all rule
//! sends lookups into it, and uid-range rules placed just above send every
//! bypassed application back to the main table.

use netwarden_core::tunnel::{TunnelBuilder, TunnelConfig, TunnelInterface};
use netwarden_core::{NetwardenError, Result};
use parking_lot::Mutex;
use std::io;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tun_rs::{DeviceBuilder, SyncDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn flag(self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }
}

/// An `ip` invocation plus the one that undoes it
struct RoutingStep {
    apply: Vec<String>,
    undo: Vec<String>,
}

/// Routing table entries and rules for one tunnel session
pub struct RoutingPlan {
    steps: Vec<RoutingStep>,
}

impl RoutingPlan {
    pub fn for_config(config: &TunnelConfig) -> Self {
        let table = config.route_table.to_string();
        let priority = config.rule_priority.to_string();
        let bypass_priority = config.rule_priority.saturating_sub(1).to_string();
        let mut steps = Vec::new();

        let mut families = Vec::new();
        for route in &config.routes {
            let family = if route.is_ipv4() { Family::V4 } else { Family::V6 };
            if !families.contains(&family) {
                families.push(family);
            }
            let route = route.to_string();
            steps.push(RoutingStep {
                apply: args(&[family.flag(), "route", "replace", &route, "dev", &config.name, "table", &table]),
                undo: args(&[family.flag(), "route", "del", &route, "dev", &config.name, "table", &table]),
            });
        }

        for family in families {
            // null-routed sessions fall through to main without per-app rules
            if !config.is_null_routed() {
                for uid in config.bypass_uids() {
                    let range = format!("{}-{}", uid, uid);
                    steps.push(RoutingStep {
                        apply: args(&[
                            family.flag(), "rule", "add", "uidrange", &range, "lookup", "main", "priority",
                            &bypass_priority,
                        ]),
                        undo: args(&[
                            family.flag(), "rule", "del", "uidrange", &range, "lookup", "main", "priority",
                            &bypass_priority,
                        ]),
                    });
                }
            }
            steps.push(RoutingStep {
                apply: args(&[family.flag(), "rule", "add", "lookup", &table, "priority", &priority]),
                undo: args(&[family.flag(), "rule", "del", "lookup", &table, "priority", &priority]),
            });
        }

        Self { steps }
    }

    /// Apply every step; on failure roll back what was applied
    fn apply(&self) -> Result<usize> {
        for (applied, step) in self.steps.iter().enumerate() {
            if let Err(e) = run_ip(&step.apply) {
                self.undo(applied);
                return Err(NetwardenError::Establish(e.to_string()));
            }
        }
        Ok(self.steps.len())
    }

    fn undo(&self, applied: usize) {
        for step in self.steps[..applied].iter().rev() {
            if let Err(e) = run_ip(&step.undo) {
                debug!("Routing cleanup step failed: {}", e);
            }
        }
    }

    #[cfg(test)]
    fn commands(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.apply.join(" ")).collect()
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn run_ip(args: &[String]) -> io::Result<()> {
    let output = Command::new("ip").args(args).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

pub struct LinuxTunnelBuilder;

impl TunnelBuilder for LinuxTunnelBuilder {
    fn establish(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelInterface>> {
        let device = DeviceBuilder::new()
            .name(&config.name)
            .ipv4(config.address_v4.ip(), config.address_v4.prefix(), None)
            .ipv6(config.address_v6.ip(), config.address_v6.prefix())
            .mtu(config.mtu)
            .build_sync()
            .map_err(|e| NetwardenError::Establish(format!("Failed to create TUN {}: {}", config.name, e)))?;
        device
            .set_nonblocking(!config.blocking)
            .map_err(|e| NetwardenError::Establish(e.to_string()))?;

        let routing = RoutingPlan::for_config(config);
        let steps = routing.apply()?;
        apply_dns(config);

        info!(
            "TUN device {} up as {} / {} with {} routing steps",
            config.name, config.address_v4, config.address_v6, steps
        );
        Ok(Arc::new(LinuxTunnel {
            name: config.name.clone(),
            device: Mutex::new(Some(device)),
            routing,
        }))
    }
}

fn apply_dns(config: &TunnelConfig) {
    let mut args = vec!["dns".to_string(), config.name.clone()];
    args.extend(config.dns_servers.iter().map(|s| s.to_string()));
    match Command::new("resolvectl").args(&args).output() {
        Ok(output) if output.status.success() => debug!("Tunnel DNS set to {:?}", config.dns_servers),
        Ok(output) => debug!(
            "resolvectl refused tunnel DNS: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => debug!("resolvectl unavailable: {}", e),
    }
}

pub struct LinuxTunnel {
    name: String,
    device: Mutex<Option<SyncDevice>>,
    routing: RoutingPlan,
}

impl TunnelInterface for LinuxTunnel {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.device.lock();
        let Some(device) = guard.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        device.recv(buf).map_err(map_revocation)
    }

    fn close(&self) {
        let device = self.device.lock().take();
        if device.is_some() {
            self.routing.undo(self.routing.steps.len());
            drop(device);
            info!("TUN device {} removed", self.name);
        }
    }
}

impl Drop for LinuxTunnel {
    fn drop(&mut self) {
        if self.device.get_mut().is_some() {
            warn!("TUN device {} dropped without close", self.name);
            self.close();
        }
    }
}

/// The device disappearing means the tunnel was taken away
fn map_revocation(e: io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(code) if code == libc::ENODEV || code == libc::EBADFD => {
            io::Error::new(io::ErrorKind::NotConnected, e)
        }
        _ => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netwarden_core::config::TunnelSettings;
    use netwarden_core::tunnel::TunnelApp;
    use netwarden_core::{InstalledApp, TransportState};
    use std::collections::BTreeSet;

    fn me() -> TunnelApp {
        TunnelApp {
            identifier: "netwarden".into(),
            uid: 990,
        }
    }

    #[test]
    fn test_null_route_plan_has_no_uid_rules() {
        let config =
            TunnelConfig::plan(&TunnelSettings::default(), TransportState::Wifi, BTreeSet::new(), &[], &me())
                .unwrap();

        let commands = RoutingPlan::for_config(&config).commands();

        assert_eq!(
            commands,
            vec![
                "-4 route replace 10.255.255.255/32 dev nwtun0 table 5288",
                "-4 rule add lookup 5288 priority 5288",
            ]
        );
    }

    #[test]
    fn test_blocking_plan_bypasses_allowed_uids() {
        let installed = vec![
            InstalledApp {
                identifier: "alice".into(),
                display_name: "Alice".into(),
                uid: 1000,
                is_system: false,
            },
            InstalledApp {
                identifier: "bob".into(),
                display_name: "Bob".into(),
                uid: 1001,
                is_system: false,
            },
        ];
        let blocked = BTreeSet::from(["bob".to_string()]);
        let config =
            TunnelConfig::plan(&TunnelSettings::default(), TransportState::Wifi, blocked, &installed, &me())
                .unwrap();

        let commands = RoutingPlan::for_config(&config).commands();

        assert!(commands.contains(&"-4 route replace 0.0.0.0/0 dev nwtun0 table 5288".to_string()));
        assert!(commands.contains(&"-6 route replace ::/0 dev nwtun0 table 5288".to_string()));
        assert!(commands.contains(&"-4 rule add uidrange 1000-1000 lookup main priority 5287".to_string()));
        assert!(commands.contains(&"-6 rule add uidrange 990-990 lookup main priority 5287".to_string()));
        assert!(!commands.iter().any(|c| c.contains("1001-1001")));
        assert_eq!(commands.last().unwrap(), "-6 rule add lookup 5288 priority 5288");
    }

    #[test]
    fn test_shared_root_uid_gets_a_single_rule() {
        let installed = vec![
            InstalledApp {
                identifier: "root".into(),
                display_name: "root".into(),
                uid: 0,
                is_system: true,
            },
            InstalledApp {
                identifier: "bob".into(),
                display_name: "Bob".into(),
                uid: 1001,
                is_system: false,
            },
        ];
        let root_self = TunnelApp {
            identifier: "netwarden".into(),
            uid: 0,
        };
        let blocked = BTreeSet::from(["bob".to_string()]);
        let config =
            TunnelConfig::plan(&TunnelSettings::default(), TransportState::Wifi, blocked, &installed, &root_self)
                .unwrap();

        let commands = RoutingPlan::for_config(&config).commands();

        for flag in ["-4", "-6"] {
            let rule = format!("{} rule add uidrange 0-0 lookup main priority 5287", flag);
            assert_eq!(commands.iter().filter(|c| **c == rule).count(), 1);
        }
        assert!(!commands.iter().any(|c| c.contains("1001-1001")));
    }

    #[test]
    fn test_device_loss_maps_to_revocation() {
        let gone = map_revocation(io::Error::from_raw_os_error(libc::ENODEV));
        assert_eq!(gone.kind(), io::ErrorKind::NotConnected);

        let again = map_revocation(io::Error::from_raw_os_error(libc::EAGAIN));
        assert_eq!(again.kind(), io::ErrorKind::WouldBlock);
    }
}
