//! Flow owner lookup from `/proc/net`.

use netwarden_core::classifier::{FlowOwnerResolver, PROTO_TCP, PROTO_UDP};
use netwarden_core::Uid;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// Socket row from `/proc/net/{tcp,udp}[6]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub uid: Uid,
}

pub struct ProcNetResolver {
    root: PathBuf,
}

impl ProcNetResolver {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc/net"),
        }
    }

    fn tables(protocol: u8) -> &'static [&'static str] {
        match protocol {
            PROTO_TCP => &["tcp", "tcp6"],
            PROTO_UDP => &["udp", "udp6"],
            _ => &[],
        }
    }

    fn entries(&self, table: &str) -> Vec<SocketEntry> {
        let Ok(file) = File::open(self.root.join(table)) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .skip(1)
            .map_while(|line| line.ok())
            .filter_map(|line| parse_socket_line(&line))
            .collect()
    }
}

impl Default for ProcNetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowOwnerResolver for ProcNetResolver {
    fn resolve(&self, destination: IpAddr, port: u16, protocol: u8) -> Option<Uid> {
        Self::tables(protocol).iter().find_map(|table| {
            self.entries(table)
                .into_iter()
                .find(|entry| entry.remote_port == port && same_address(&entry.remote_addr, &destination))
                .map(|entry| entry.uid)
        })
    }
}

/// Treats IPv4-mapped IPv6 addresses as their IPv4 form
fn same_address(a: &IpAddr, b: &IpAddr) -> bool {
    canonical(a) == canonical(b)
}

fn canonical(addr: &IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*addr),
        IpAddr::V4(_) => *addr,
    }
}

pub fn parse_socket_line(line: &str) -> Option<SocketEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 {
        return None;
    }

    let (local_addr, local_port) = parse_hex_address(parts[1])?;
    let (remote_addr, remote_port) = parse_hex_address(parts[2])?;
    let uid = parts[7].parse::<Uid>().ok()?;

    Some(SocketEntry {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        uid,
    })
}

/// Kernel prints each 32-bit word of the address in host order
fn parse_hex_address(s: &str) -> Option<(IpAddr, u16)> {
    let (hex_addr, hex_port) = s.split_once(':')?;
    let port = u16::from_str_radix(hex_port, 16).ok()?;

    match hex_addr.len() {
        8 => {
            let word = u32::from_str_radix(hex_addr, 16).ok()?;
            Some((IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes())), port))
        }
        32 => {
            let mut octets = [0u8; 16];
            for i in 0..4 {
                let word = u32::from_str_radix(&hex_addr[i * 8..(i + 1) * 8], 16).ok()?;
                octets[i * 4..(i + 1) * 4].copy_from_slice(&word.to_ne_bytes());
            }
            Some((IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // little-endian encodings, as produced on x86_64 and aarch64
    #[cfg(target_endian = "little")]
    #[test]
    fn test_parse_ipv4_row() {
        let line = "   0: 0100007F:0277 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0";
        let entry = parse_socket_line(line).unwrap();

        assert_eq!(entry.local_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(entry.local_port, 631);
        assert_eq!(entry.remote_addr, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(entry.remote_port, 443);
        assert_eq!(entry.uid, 1000);
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_parse_ipv6_row() {
        let line = "   1: 00000000000000000000000001000000:0016 B80D0120000000000000000001000000:0035 01 00000000:00000000 00:00000000 00000000   998        0 999 1 0000000000000000 100 0 0 10 0";
        let entry = parse_socket_line(line).unwrap();

        assert_eq!(entry.local_addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(entry.remote_addr, "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(entry.remote_port, 53);
        assert_eq!(entry.uid, 998);
    }

    #[test]
    fn test_mapped_addresses_match_ipv4() {
        let mapped: IpAddr = "::ffff:10.0.0.1".parse().unwrap();
        let plain: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(same_address(&mapped, &plain));
        assert!(!same_address(&mapped, &"10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_short_or_garbled_rows_are_skipped() {
        assert!(parse_socket_line("  sl  local_address rem_address   st").is_none());
        assert!(parse_socket_line("0: ZZZZ:0016 0100007F:0016 01 0 0 0 1000").is_none());
    }

    #[test]
    fn test_unknown_protocol_resolves_nothing() {
        let resolver = ProcNetResolver::new();
        assert!(resolver.resolve("10.0.0.1".parse().unwrap(), 0, 1).is_none());
    }
}
