use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::store::{RequestLog, Store};

const QUEUE_CAPACITY: usize = 1000;
const FLUSH_BATCH: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// 异步落库的用量日志管道：有界队列 + 后台批量写入。
///
/// Producers never block: a full queue drops the record with a warning.
/// Billing counters are incremented elsewhere, so a dropped record loses
/// audit detail but never billing correctness.
#[derive(Debug, Clone)]
pub struct LogPipeline {
    tx: mpsc::Sender<RequestLog>,
}

impl LogPipeline {
    pub fn spawn(store: Store) -> Self {
        Self::spawn_with(store, QUEUE_CAPACITY, FLUSH_BATCH, FLUSH_INTERVAL)
    }

    /// Queue capacity, batch size, and flush interval are injectable so
    /// tests can run against short timers.
    pub fn spawn_with(
        store: Store,
        capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestLog>(capacity);

        tokio::spawn(async move {
            let mut buffer: Vec<RequestLog> = Vec::with_capacity(batch_size);
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    entry = rx.recv() => match entry {
                        Some(entry) => {
                            buffer.push(entry);
                            if buffer.len() >= batch_size {
                                flush(&store, &mut buffer).await;
                            }
                        }
                        // All senders gone: final flush, then stop.
                        None => {
                            flush(&store, &mut buffer).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        flush(&store, &mut buffer).await;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Non-blocking enqueue; drops on a full queue.
    pub fn record(&self, entry: RequestLog) {
        if self.tx.try_send(entry).is_err() {
            warn!("usage log queue full, dropping entry");
        }
    }
}

async fn flush(store: &Store, buffer: &mut Vec<RequestLog>) {
    if buffer.is_empty() {
        return;
    }
    if let Err(err) = store.insert_usage_batch(buffer).await {
        warn!(count = buffer.len(), "failed to flush usage logs: {err}");
    }
    buffer.clear();
}
