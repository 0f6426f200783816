//! Packet classifier.
//!
//! Parses the IP header of a raw packet, resolves the owning uid and decides
//! allow/block from the rule cache and the current transport. Blocks are
//! queued on the log batcher.

use crate::log_batcher::LogBatcher;
use crate::rule_cache::RuleCache;
use crate::transport::TransportMonitor;
use crate::types::{TransportState, Uid};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Transport-layer fields of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub protocol: u8,
    pub destination: IpAddr,
    /// Zero when the protocol carries no port or the buffer ends early
    pub port: u16,
}

impl PacketHeader {
    pub fn destination_text(&self) -> String {
        format_address(&self.destination)
    }
}

/// Result of classifying one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDecision {
    pub blocked: bool,
    pub uid: Uid,
    pub destination: String,
    pub port: u16,
    pub transport: TransportState,
}

/// Maps a flow to the uid that owns it
pub trait FlowOwnerResolver: Send + Sync {
    fn resolve(&self, destination: IpAddr, port: u16, protocol: u8) -> Option<Uid>;
}

impl<F> FlowOwnerResolver for F
where
    F: Fn(IpAddr, u16, u8) -> Option<Uid> + Send + Sync,
{
    fn resolve(&self, destination: IpAddr, port: u16, protocol: u8) -> Option<Uid> {
        self(destination, port, protocol)
    }
}

/// Parse the fixed IP header. `None` for short buffers, bad IHL and unknown versions.
pub fn parse_header(packet: &[u8]) -> Option<PacketHeader> {
    let first = *packet.first()?;
    match first >> 4 {
        4 => {
            if packet.len() < IPV4_MIN_HEADER {
                return None;
            }
            let header_len = usize::from(first & 0x0f) * 4;
            if header_len < IPV4_MIN_HEADER {
                return None;
            }
            let protocol = packet[9];
            let destination = IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]));
            Some(PacketHeader {
                version: 4,
                protocol,
                destination,
                port: read_port(packet, header_len + 2, protocol),
            })
        }
        6 => {
            if packet.len() < IPV6_HEADER {
                return None;
            }
            let protocol = packet[6];
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(PacketHeader {
                version: 6,
                protocol,
                destination: IpAddr::V6(Ipv6Addr::from(octets)),
                port: read_port(packet, IPV6_HEADER + 2, protocol),
            })
        }
        _ => None,
    }
}

fn read_port(packet: &[u8], offset: usize, protocol: u8) -> u16 {
    if protocol != PROTO_TCP && protocol != PROTO_UDP {
        return 0;
    }
    match packet.get(offset..offset + 2) {
        Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
        None => 0,
    }
}

/// Dotted decimal for IPv4; eight zero-padded lowercase groups for IPv6
pub fn format_address(address: &IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|segment| format!("{:04x}", segment))
            .collect::<Vec<_>>()
            .join(":"),
    }
}

pub struct PacketClassifier {
    cache: Arc<RuleCache>,
    monitor: Arc<TransportMonitor>,
    batcher: Option<Arc<LogBatcher>>,
}

impl PacketClassifier {
    pub fn new(cache: Arc<RuleCache>, monitor: Arc<TransportMonitor>) -> Self {
        Self {
            cache,
            monitor,
            batcher: None,
        }
    }

    /// Queue a log record for every block decision
    pub fn with_batcher(mut self, batcher: Arc<LogBatcher>) -> Self {
        self.batcher = Some(batcher);
        self
    }

    pub fn classify(&self, packet: &[u8], resolver: &dyn FlowOwnerResolver) -> Option<PacketDecision> {
        let header = parse_header(packet)?;
        let uid = resolver
            .resolve(header.destination, header.port, header.protocol)
            .filter(|uid| *uid > 0)?;

        let transport = self.monitor.current_transport();
        let blocked = self.cache.decide_for_uid(uid, transport);
        let destination = header.destination_text();

        if blocked {
            if let Some(batcher) = &self.batcher {
                let (identifier, display_name) = self
                    .cache
                    .describe(uid)
                    .unwrap_or_else(|| (uid.to_string(), uid.to_string()));
                batcher.record(&identifier, &display_name, &destination, header.port, transport);
            }
        }

        Some(PacketDecision {
            blocked,
            uid,
            destination,
            port: header.port,
            transport,
        })
    }
}
