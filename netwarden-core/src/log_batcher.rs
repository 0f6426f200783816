//! Batched writer for blocked-connection records.
//!
//! `record` only touches an in-memory queue. Full batches go over a channel to
//! a writer task that performs the store insert off the caller's thread.

use crate::store::LogStore;
use crate::types::{ConnectionLogRecord, TransportState};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

enum WriterMessage {
    Batch(Vec<ConnectionLogRecord>),
    /// Acknowledged once every earlier batch is written
    Sync(oneshot::Sender<()>),
}

struct Queue {
    records: VecDeque<ConnectionLogRecord>,
    last_flush: Instant,
}

pub struct LogBatcher {
    queue: Mutex<Queue>,
    batch_size: usize,
    flush_interval: Duration,
    writer: mpsc::UnboundedSender<WriterMessage>,
}

impl LogBatcher {
    /// Create the batcher and spawn its writer task on the current runtime
    pub fn new(store: Arc<dyn LogStore>, batch_size: usize, flush_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store, rx));
        Self {
            queue: Mutex::new(Queue {
                records: VecDeque::new(),
                last_flush: Instant::now(),
            }),
            batch_size: batch_size.max(1),
            flush_interval,
            writer: tx,
        }
    }

    pub fn with_defaults(store: Arc<dyn LogStore>) -> Self {
        Self::new(store, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL)
    }

    /// Queue a blocked connection; flushes when the batch is full or overdue
    pub fn record(
        &self,
        identifier: &str,
        display_name: &str,
        destination: &str,
        port: u16,
        transport: TransportState,
    ) {
        self.push(ConnectionLogRecord::blocked(
            identifier,
            display_name,
            destination,
            port,
            transport,
        ));
    }

    pub fn push(&self, record: ConnectionLogRecord) {
        let batch = {
            let mut queue = self.queue.lock();
            queue.records.push_back(record);
            if queue.records.len() >= self.batch_size
                || queue.last_flush.elapsed() >= self.flush_interval
            {
                Some(Self::drain(&mut queue))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.send(batch);
        }
    }

    /// Flush whatever is queued
    pub fn force_flush(&self) {
        let batch = Self::drain(&mut self.queue.lock());
        self.send(batch);
    }

    /// Flush if records are waiting and the interval has elapsed.
    /// Driven by a ticker so a quiet queue still reaches the store.
    pub fn flush_if_due(&self) {
        let batch = {
            let mut queue = self.queue.lock();
            if queue.records.is_empty() || queue.last_flush.elapsed() < self.flush_interval {
                return;
            }
            Self::drain(&mut queue)
        };
        self.send(batch);
    }

    /// Wait until every batch sent so far has been written
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterMessage::Sync(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().records.len()
    }

    fn drain(queue: &mut Queue) -> Vec<ConnectionLogRecord> {
        queue.last_flush = Instant::now();
        queue.records.drain(..).collect()
    }

    fn send(&self, batch: Vec<ConnectionLogRecord>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if self.writer.send(WriterMessage::Batch(batch)).is_err() {
            warn!("Log writer has stopped; dropped {} records", count);
        }
    }
}

async fn run_writer(store: Arc<dyn LogStore>, mut rx: mpsc::UnboundedReceiver<WriterMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Batch(batch) => {
                let count = batch.len();
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.insert_logs(&batch)).await {
                    Ok(Ok(())) => debug!("Flushed {} connection records", count),
                    Ok(Err(e)) => warn!("Failed to write {} connection records: {}", count, e),
                    Err(e) => warn!("Log writer task failed: {}", e),
                }
            }
            WriterMessage::Sync(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
