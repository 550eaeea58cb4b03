//! Log consumption: the seam to the ordered mutation feed and the loop
//! that drives records through the processor.
//!
//! Acknowledgment is deliberately late: a record is acked only after its
//! disposition resolves, so a crash mid-flight re-delivers the record
//! instead of losing it. Re-delivery is safe because terminal-status
//! filtering drops already-settled entries on the second pass.

use crate::processor::{Disposition, Processor, RawRecord};
use async_trait::async_trait;
use siphon_core::error::ReplicationError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;

/// Source of ordered replication records.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Fetch the next record; `Ok(None)` means the feed has ended.
    async fn next_record(&self) -> Result<Option<RawRecord>, ReplicationError>;

    /// Acknowledge a record as fully settled; never called before the
    /// record's disposition has resolved.
    async fn ack(&self, record: &RawRecord) -> Result<(), ReplicationError>;
}

/// In-process channel-backed feed; the production transport binding plugs
/// in behind the same trait.
pub struct ChannelConsumer {
    records: Mutex<mpsc::Receiver<RawRecord>>,
    acked: std::sync::Mutex<Vec<String>>,
}

impl ChannelConsumer {
    /// Create a feed of the given capacity; the sender side injects
    /// records, dropping it ends the feed.
    pub fn pair(capacity: usize) -> (mpsc::Sender<RawRecord>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                records: Mutex::new(rx),
                acked: std::sync::Mutex::new(Vec::new()),
            },
        )
    }

    /// Keys acknowledged so far, in acknowledgment order.
    pub fn acked_keys(&self) -> Vec<String> {
        self.acked.lock().expect("acked lock").clone()
    }
}

#[async_trait]
impl LogConsumer for ChannelConsumer {
    async fn next_record(&self) -> Result<Option<RawRecord>, ReplicationError> {
        Ok(self.records.lock().await.recv().await)
    }

    async fn ack(&self, record: &RawRecord) -> Result<(), ReplicationError> {
        self.acked.lock().expect("acked lock").push(record.key.clone());
        Ok(())
    }
}

/// Pause after a failed fetch before polling the feed again.
const FETCH_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Drives records from a [`LogConsumer`] through a [`Processor`],
/// acknowledging each record once its disposition resolves.
pub struct ConsumerLoop {
    processor: Arc<Processor>,
    consumer: Arc<dyn LogConsumer>,
    shutdown: Arc<Notify>,
}

impl ConsumerLoop {
    /// Wire a consumer loop; call [`run`](Self::run) to start it.
    pub fn new(processor: Arc<Processor>, consumer: Arc<dyn LogConsumer>) -> Self {
        Self {
            processor,
            consumer,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle for requesting shutdown; `notify_one` on it stops the loop
    /// after the in-flight records settle.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Consume until the feed ends or shutdown is requested.
    ///
    /// A natural feed end drains every in-flight record and acknowledges
    /// it. Shutdown abandons in-flight retries instead: their records stay
    /// unacknowledged and the transport re-delivers them, so a record stuck
    /// in an unbounded retry loop can never stall shutdown.
    pub async fn run(&self) {
        let mut settling = JoinSet::new();
        let mut shutting_down = false;
        loop {
            let fetched = tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("shutdown requested, abandoning in-flight records");
                    shutting_down = true;
                    break;
                }
                fetched = self.consumer.next_record() => fetched,
            };
            match fetched {
                Ok(Some(record)) => {
                    let disposition = self.processor.submit(record.clone()).await;
                    let consumer = self.consumer.clone();
                    settling.spawn(async move {
                        match disposition.await {
                            Ok(outcome) => {
                                if let Disposition::Dropped { reason } = &outcome {
                                    tracing::debug!(key = %record.key, reason = %reason, "record dropped");
                                }
                                if let Err(err) = consumer.ack(&record).await {
                                    tracing::error!(key = %record.key, error = %err, "failed to acknowledge record");
                                }
                            }
                            Err(_) => {
                                // Processor went away before settling; the
                                // record stays unacked for re-delivery.
                                tracing::warn!(key = %record.key, "record never settled, leaving unacknowledged");
                            }
                        }
                    });
                }
                Ok(None) => {
                    tracing::info!("record feed ended");
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to fetch record from feed");
                    tokio::time::sleep(FETCH_ERROR_PAUSE).await;
                }
            }
        }
        if shutting_down {
            settling.shutdown().await;
            return;
        }
        self.processor.drain().await;
        while settling.join_next().await.is_some() {}
    }
}
