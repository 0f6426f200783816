//! Connectivity provider backed by `/proc/net` and sysfs.
//!
//! The default-route interface is the active network. A poller thread
//! compares it against the previous sample and reports changes.

use netwarden_core::transport::{ConnectivityProvider, NetworkCallback, NetworkEvent, TransportCapabilities};
use netwarden_core::Result;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const ARPHRD_ETHER: &str = "1";
const RTF_UP: u32 = 0x0001;
const RTF_REJECT: u32 = 0x0200;

const CELLULAR_PREFIXES: &[&str] = &["wwan", "rmnet", "ccmni"];

/// Where to look for routes and interface metadata
#[derive(Debug, Clone)]
struct RouteScanner {
    proc_net: PathBuf,
    sys_class_net: PathBuf,
    /// Interface never treated as the active network
    exclude: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveNetwork {
    interface: String,
    capabilities: TransportCapabilities,
}

impl RouteScanner {
    fn active(&self) -> Option<ActiveNetwork> {
        let interface = self.default_interface()?;
        let capabilities = classify_interface(&self.sys_class_net.join(&interface), &interface);
        Some(ActiveNetwork {
            interface,
            capabilities,
        })
    }

    fn default_interface(&self) -> Option<String> {
        let v4 = fs::read_to_string(self.proc_net.join("route"))
            .ok()
            .and_then(|content| default_route_v4(&content, &self.exclude));
        v4.or_else(|| {
            fs::read_to_string(self.proc_net.join("ipv6_route"))
                .ok()
                .and_then(|content| default_route_v6(&content, &self.exclude))
        })
    }
}

/// Lowest-metric default route in `/proc/net/route`
fn default_route_v4(content: &str, exclude: &str) -> Option<String> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 8 {
                return None;
            }
            let flags = u32::from_str_radix(parts[3], 16).ok()?;
            let metric = parts[6].parse::<u32>().ok()?;
            let is_default = parts[1] == "00000000" && parts[7] == "00000000";
            (is_default && flags & RTF_UP != 0 && parts[0] != exclude).then(|| (metric, parts[0].to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

/// Lowest-metric default route in `/proc/net/ipv6_route`
fn default_route_v6(content: &str, exclude: &str) -> Option<String> {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 {
                return None;
            }
            let iface = parts[9];
            let flags = u32::from_str_radix(parts[8], 16).ok()?;
            let metric = u32::from_str_radix(parts[5], 16).ok()?;
            let is_default = parts[1] == "00" && parts[0].bytes().all(|b| b == b'0');
            (is_default && flags & RTF_UP != 0 && flags & RTF_REJECT == 0 && iface != "lo" && iface != exclude)
                .then(|| (metric, iface.to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

fn classify_interface(dir: &Path, name: &str) -> TransportCapabilities {
    let uevent = fs::read_to_string(dir.join("uevent")).unwrap_or_default();
    let devtype = uevent
        .lines()
        .find_map(|line| line.strip_prefix("DEVTYPE="))
        .unwrap_or("")
        .trim()
        .to_string();
    let link_type = fs::read_to_string(dir.join("type")).unwrap_or_default();
    let operstate = fs::read_to_string(dir.join("operstate")).unwrap_or_default();

    let wifi = dir.join("wireless").exists() || dir.join("phy80211").exists() || devtype == "wlan";
    let cellular = devtype == "wwan" || CELLULAR_PREFIXES.iter().any(|p| name.starts_with(p));
    let ethernet = !wifi && !cellular && link_type.trim() == ARPHRD_ETHER;

    TransportCapabilities {
        cellular,
        wifi,
        ethernet,
        internet: operstate.trim() != "down",
    }
}

struct Poller {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SysfsConnectivity {
    scanner: RouteScanner,
    interval: Duration,
    poller: Mutex<Option<Poller>>,
}

impl SysfsConnectivity {
    pub fn new(tunnel_name: &str, interval: Duration) -> Self {
        Self::with_roots("/proc/net", "/sys/class/net", tunnel_name, interval)
    }

    fn with_roots(proc_net: impl Into<PathBuf>, sys_class_net: impl Into<PathBuf>, exclude: &str, interval: Duration) -> Self {
        Self {
            scanner: RouteScanner {
                proc_net: proc_net.into(),
                sys_class_net: sys_class_net.into(),
                exclude: exclude.to_string(),
            },
            interval,
            poller: Mutex::new(None),
        }
    }
}

impl ConnectivityProvider for SysfsConnectivity {
    fn active_network(&self) -> Option<TransportCapabilities> {
        self.scanner.active().map(|network| network.capabilities)
    }

    fn register(&self, callback: NetworkCallback) -> Result<()> {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let scanner = self.scanner.clone();
        let interval = self.interval;
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("netwarden-connectivity".into())
            .spawn(move || poll_loop(scanner, interval, flag, callback))?;

        *poller = Some(Poller { stop, handle });
        Ok(())
    }

    fn unregister(&self) {
        let Some(poller) = self.poller.lock().take() else {
            return;
        };
        poller.stop.store(true, Ordering::Release);
        poller.handle.thread().unpark();
        if poller.handle.join().is_err() {
            warn!("Connectivity poller panicked");
        }
    }
}

impl Drop for SysfsConnectivity {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn poll_loop(scanner: RouteScanner, interval: Duration, stop: Arc<AtomicBool>, callback: NetworkCallback) {
    let mut last = scanner.active();
    while !stop.load(Ordering::Acquire) {
        thread::park_timeout(interval);
        if stop.load(Ordering::Acquire) {
            break;
        }
        let now = scanner.active();
        if let Some(event) = transition(&last, &now) {
            debug!("Connectivity {:?} -> {:?}", last, now);
            callback(event);
        }
        last = now;
    }
}

fn transition(last: &Option<ActiveNetwork>, now: &Option<ActiveNetwork>) -> Option<NetworkEvent> {
    match (last, now) {
        (None, Some(network)) => Some(NetworkEvent::Available(network.capabilities)),
        (Some(_), None) => Some(NetworkEvent::Lost),
        (Some(before), Some(after)) if before.interface != after.interface => {
            Some(NetworkEvent::Available(after.capabilities))
        }
        (Some(before), Some(after)) if before.capabilities != after.capabilities => {
            Some(NetworkEvent::CapabilitiesChanged(after.capabilities))
        }
        _ => None,
    }
}
