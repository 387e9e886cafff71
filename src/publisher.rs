//! Asynchronous fan-out of records to the durable store and the broker.

use crate::{
    error::{SinkError, SyncError},
    metrics::Metrics,
    record::{BlockRecord, PublishableRecord},
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Durable sink. Only block records are persisted.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_block_record(&self, record: &BlockRecord) -> Result<(), SinkError>;
}

/// Pub/sub sink.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), SinkError>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_block_channel")]
    pub block_channel: String,
    #[serde(default = "default_tx_channel")]
    pub tx_channel: String,
}

fn default_queue_capacity() -> usize { 1024 }
fn default_workers() -> usize { 4 }
fn default_block_channel() -> String { "BlockInfo".into() }
fn default_tx_channel() -> String { "TxInfo".into() }

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            block_channel: default_block_channel(),
            tx_channel: default_tx_channel(),
        }
    }
}

/// Submission side. Cheap to clone; the workers stop once every clone is gone
/// and the queue has drained.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<PublishableRecord>,
    metrics: Arc<Metrics>,
}

pub struct PublisherWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl PublisherWorkers {
    pub async fn join(self) {
        for h in self.handles {
            let _ = h.await;
        }
    }
}

struct Sinks {
    store: Option<Arc<dyn RecordStore>>,
    broker: Arc<dyn MessageBroker>,
    block_channel: String,
    tx_channel: String,
    metrics: Arc<Metrics>,
}

impl EventPublisher {
    pub fn spawn(
        cfg: &PublisherConfig,
        store: Option<Arc<dyn RecordStore>>,
        broker: Arc<dyn MessageBroker>,
        metrics: Arc<Metrics>,
    ) -> (Self, PublisherWorkers) {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let sinks = Arc::new(Sinks {
            store,
            broker,
            block_channel: cfg.block_channel.clone(),
            tx_channel: cfg.tx_channel.clone(),
            metrics: metrics.clone(),
        });

        let handles = (0..cfg.workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let sinks = sinks.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(record) = next else { break };
                        sinks.deliver(&record).await;
                    }
                    debug!(worker, "publisher worker stopped");
                })
            })
            .collect();

        (Self { tx, metrics }, PublisherWorkers { handles })
    }

    /// Enqueue without waiting. A full queue rejects the new record.
    pub fn submit(&self, record: PublishableRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.metrics.publish_dropped.inc();
                warn!(hash = %record.hash(), kind = record.kind(), "publish queue full, record dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                warn!(hash = %record.hash(), "publisher stopped, record dropped");
                false
            }
        }
    }
}

impl Sinks {
    async fn deliver(&self, record: &PublishableRecord) {
        if let (PublishableRecord::Block(block), Some(store)) = (record, &self.store) {
            if let Err(e) = store.insert_block_record(block).await {
                self.failed(record, "store", e);
            }
        }

        let channel = match record {
            PublishableRecord::Block(_) => &self.block_channel,
            PublishableRecord::Transaction(_) => &self.tx_channel,
        };
        let published = match record.to_json() {
            Ok(payload) => self.broker.publish(channel, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            self.failed(record, "broker", e);
        }
    }

    fn failed(&self, record: &PublishableRecord, sink: &'static str, e: SinkError) {
        self.metrics.sink_failures.with_label_values(&[sink]).inc();
        let err = SyncError::SinkFailure { sink, reason: e.to_string() };
        warn!(hash = %record.hash(), sink, %err, "sink write failed");
    }
}
