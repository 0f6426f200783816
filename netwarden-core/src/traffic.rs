//! Upload and download rate sampling for the dashboard.

use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Byte counters for the whole host
pub trait TrafficCounters: Send + Sync {
    /// Total `(received, transmitted)` bytes
    fn totals(&self) -> Result<(u64, u64)>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    /// Bytes per second
    pub download_speed: u64,
    pub upload_speed: u64,
    pub total_download: u64,
    pub total_upload: u64,
}

impl TrafficSample {
    pub fn download_speed_formatted(&self) -> String {
        format_speed(self.download_speed)
    }

    pub fn upload_speed_formatted(&self) -> String {
        format_speed(self.upload_speed)
    }
}

pub fn format_speed(bytes_per_second: u64) -> String {
    if bytes_per_second >= 1_000_000 {
        format!("{:.1} MB/s", bytes_per_second as f64 / 1_000_000.0)
    } else if bytes_per_second >= 1_000 {
        format!("{:.1} KB/s", bytes_per_second as f64 / 1_000.0)
    } else {
        format!("{} B/s", bytes_per_second)
    }
}

pub struct TrafficTracker {
    counters: Arc<dyn TrafficCounters>,
    interval: Duration,
    tx: watch::Sender<TrafficSample>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TrafficTracker {
    pub fn new(counters: Arc<dyn TrafficCounters>) -> Self {
        Self::with_interval(counters, SAMPLE_INTERVAL)
    }

    pub fn with_interval(counters: Arc<dyn TrafficCounters>, interval: Duration) -> Self {
        let (tx, _) = watch::channel(TrafficSample::default());
        Self {
            counters,
            interval,
            tx,
            task: Mutex::new(None),
        }
    }

    /// Begin sampling; no-op while already running
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let counters = self.counters.clone();
        let tx = self.tx.clone();
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let (mut last_rx, mut last_tx) = counters.totals().unwrap_or((0, 0));
            let mut last_at = Instant::now();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let (rx, tx_bytes) = match counters.totals() {
                    Ok(totals) => totals,
                    Err(e) => {
                        debug!("Traffic counters unavailable: {}", e);
                        continue;
                    }
                };
                let now = Instant::now();
                let elapsed = now.duration_since(last_at).as_secs_f64();
                if elapsed > 0.0 {
                    tx.send_replace(TrafficSample {
                        download_speed: (rx.saturating_sub(last_rx) as f64 / elapsed) as u64,
                        upload_speed: (tx_bytes.saturating_sub(last_tx) as f64 / elapsed) as u64,
                        total_download: rx,
                        total_upload: tx_bytes,
                    });
                }
                last_rx = rx;
                last_tx = tx_bytes;
                last_at = now;
            }
        }));
    }

    /// Stop sampling and reset the published sample to zero
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.tx.send_replace(TrafficSample::default());
    }

    pub fn current(&self) -> TrafficSample {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrafficSample> {
        self.tx.subscribe()
    }
}

impl Drop for TrafficTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
