use netwarden_core::traffic::TrafficCounters;
use netwarden_core::Result;
use std::fs;
use std::path::PathBuf;

/// Host byte counters from `/proc/net/dev`, minus loopback and the tunnel
pub struct ProcNetDev {
    path: PathBuf,
    exclude: Vec<String>,
}

impl ProcNetDev {
    pub fn new(tunnel_name: &str) -> Self {
        Self {
            path: PathBuf::from("/proc/net/dev"),
            exclude: vec!["lo".to_string(), tunnel_name.to_string()],
        }
    }
}

impl TrafficCounters for ProcNetDev {
    fn totals(&self) -> Result<(u64, u64)> {
        let content = fs::read_to_string(&self.path)?;
        Ok(sum_interfaces(&content, &self.exclude))
    }
}

/// Receive bytes are the first column after the name, transmit bytes the ninth
fn sum_interfaces(content: &str, exclude: &[String]) -> (u64, u64) {
    content
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, stats) = line.split_once(':')?;
            if exclude.iter().any(|e| e == name.trim()) {
                return None;
            }
            let fields: Vec<&str> = stats.split_whitespace().collect();
            let rx = fields.first()?.parse::<u64>().ok()?;
            let tx = fields.get(8)?.parse::<u64>().ok()?;
            Some((rx, tx))
        })
        .fold((0, 0), |(rx, tx), (r, t)| (rx.saturating_add(r), tx.saturating_add(t)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  500000     100    0    0    0     0          0         0   500000     100    0    0    0     0       0          0
  eth0: 1000000    2000    0    0    0     0          0         0   250000    1500    0    0    0     0       0          0
 wlan0:    4000      40    0    0    0     0          0         0     3000      30    0    0    0     0       0          0
nwtun0:    9999      10    0    0    0     0          0         0     9999      10    0    0    0     0       0          0
";

    #[test]
    fn test_totals_skip_loopback_and_tunnel() {
        let exclude = vec!["lo".to_string(), "nwtun0".to_string()];
        assert_eq!(sum_interfaces(DEV, &exclude), (1_004_000, 253_000));
    }

    #[test]
    fn test_truncated_rows_are_ignored() {
        let content = "header\nheader\n  eth0: 12 3\n  eth1: 10 0 0 0 0 0 0 0 20\n";
        assert_eq!(sum_interfaces(content, &[]), (10, 20));
    }
}
