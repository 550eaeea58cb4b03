//! Record processor: classification, routing, scheduling, and outcome
//! propagation for each consumed log record.
//!
//! Each record runs as one logical task: parse, filter, route to a transfer
//! strategy, execute under the per-key ordering slot with an unbounded
//! transient-retry loop, then record the terminal status on the source
//! through an independent (bounded) retry loop. The record's disposition
//! resolves only once a terminal state has been reached, and the consumer
//! acknowledges only on disposition; the ordering slot is held for the whole
//! lifecycle, so same-key successors never overtake a retry loop.

use crate::auth::CredentialBroker;
use crate::scheduler::KeyScheduler;
use crate::store::{ExternalBackend, ReplicaTarget, SourceStore, StatusWriter};
use crate::task::{DirectReplicaTask, EchoTask, ExternalBackendTask, ReplicationTask};
use siphon_core::backoff::{BackoffConfig, BackoffCtx};
use siphon_core::config::ReplicationConfig;
use siphon_core::entry::{RecordKind, ReplicationEntry, StorageBackend};
use siphon_core::error::ReplicationError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// One inbound log record: partition key plus JSON-encoded entry value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Partition key, `bucket/objectKey`.
    pub key: String,
    /// JSON-encoded entry payload.
    pub value: String,
}

/// Terminal outcome of one record; acknowledgment happens only on this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Replication succeeded and COMPLETED status propagation was attempted.
    Completed,
    /// Replication failed permanently and FAILED status propagation was
    /// attempted.
    Failed,
    /// The record was dropped without invoking a task.
    Dropped {
        /// Why the record was dropped.
        reason: String,
    },
}

#[derive(Debug, Default)]
struct StatsInner {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    transfer_retries: AtomicU64,
    status_retries: AtomicU64,
    status_write_failures: AtomicU64,
}

/// Point-in-time processor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Records handed to `submit`.
    pub submitted: u64,
    /// Records that reached COMPLETED.
    pub completed: u64,
    /// Records that reached FAILED.
    pub failed: u64,
    /// Records dropped without a task invocation.
    pub dropped: u64,
    /// Transient data-transfer failures that were retried.
    pub transfer_retries: u64,
    /// Transient status-write failures that were retried.
    pub status_retries: u64,
    /// Status writes abandoned after exhausting their attempts.
    pub status_write_failures: u64,
}

/// External client seams the processor is wired with.
pub struct ProcessorClients {
    /// Source storage (reads, replication configuration).
    pub source: Arc<dyn SourceStore>,
    /// Destination storage (data + metadata writes).
    pub target: Arc<dyn ReplicaTarget>,
    /// Source-side status writer; `None` when the source cannot be
    /// addressed (e.g. multi-role ambiguity) — status updates are then
    /// logged and skipped.
    pub status_writer: Option<Arc<dyn StatusWriter>>,
    /// Foreign backend for external-backend entries.
    pub external: Option<Arc<dyn ExternalBackend>>,
    /// Credential broker for role-based auth.
    pub broker: Option<Arc<dyn CredentialBroker>>,
}

/// The replication processor.
pub struct Processor {
    direct: Arc<ReplicationTask>,
    external: Option<Arc<ReplicationTask>>,
    echo: Option<Arc<ReplicationTask>>,
    status_writer: Option<Arc<dyn StatusWriter>>,
    backoff: BackoffConfig,
    status_backoff: BackoffConfig,
    max_status_attempts: u32,
    scheduler: KeyScheduler,
    stats: Arc<StatsInner>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("backoff", &self.backoff)
            .field("status_backoff", &self.status_backoff)
            .field("max_status_attempts", &self.max_status_attempts)
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Build a processor from validated configuration and client seams.
    ///
    /// Echo mode requires a source-side writer to loop control events back
    /// into; configuration validation has already enforced administrative
    /// credentials on both sides.
    pub fn new(
        config: &ReplicationConfig,
        clients: ProcessorClients,
    ) -> Result<Self, ReplicationError> {
        config.validate()?;

        let direct = Arc::new(ReplicationTask::DirectReplica(DirectReplicaTask::new(
            clients.source.clone(),
            clients.target.clone(),
            config.destination.auth.clone(),
            clients.broker.clone(),
        )));
        let external = clients.external.map(|backend| {
            Arc::new(ReplicationTask::ExternalBackendReplica(
                ExternalBackendTask::new(
                    clients.source.clone(),
                    backend,
                    clients.target.clone(),
                    config.destination.auth.clone(),
                    clients.broker.clone(),
                ),
            ))
        });
        let echo = if config.echo_mode {
            let writer =
                clients
                    .status_writer
                    .clone()
                    .ok_or_else(|| ReplicationError::Config {
                        reason: "echo mode requires a source-side metadata writer".to_string(),
                    })?;
            Some(Arc::new(ReplicationTask::Echo(EchoTask::new(writer))))
        } else {
            None
        };

        Ok(Self {
            direct,
            external,
            echo,
            status_writer: clients.status_writer,
            backoff: config.backoff.clone(),
            status_backoff: config.status_backoff.clone(),
            max_status_attempts: config.max_status_attempts,
            scheduler: KeyScheduler::new(),
            stats: Arc::new(StatsInner::default()),
        })
    }

    /// Submit one inbound record.
    ///
    /// Returns a receiver that resolves to the record's terminal
    /// [`Disposition`]; the consumer must acknowledge the record only once
    /// it resolves. Ineligible records resolve immediately as `Dropped`.
    pub async fn submit(&self, record: RawRecord) -> oneshot::Receiver<Disposition> {
        let (done, disposition) = oneshot::channel();
        self.stats.submitted.fetch_add(1, Ordering::SeqCst);

        let entry = match ReplicationEntry::from_record_value(&record.value) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(key = %record.key, error = %err, "error processing source entry");
                self.drop_record(done, err.to_string());
                return disposition;
            }
        };

        if entry.is_internal_marker() {
            self.drop_record(done, "internal marker key".to_string());
            return disposition;
        }
        if !entry.is_pending() {
            tracing::debug!(entry = %entry.log_info(), "skipping entry not pending replication");
            self.drop_record(done, "replication status not PENDING".to_string());
            return disposition;
        }

        let task = match entry.kind {
            RecordKind::Bucket => match &self.echo {
                Some(task) => task.clone(),
                None => {
                    tracing::debug!(
                        entry = %entry.log_info(),
                        "bucket entry received with echo mode disabled"
                    );
                    self.drop_record(done, "bucket entry without echo mode".to_string());
                    return disposition;
                }
            },
            RecordKind::Object | RecordKind::DeleteMarker => match entry.storage_backend {
                StorageBackend::Default => self.direct.clone(),
                StorageBackend::External => match &self.external {
                    Some(task) => task.clone(),
                    None => {
                        tracing::error!(
                            entry = %entry.log_info(),
                            "entry requires an external backend but none is configured"
                        );
                        self.drop_record(done, "no external backend configured".to_string());
                        return disposition;
                    }
                },
            },
        };

        let key = entry.canonical_key();
        tracing::debug!(entry = %entry.log_info(), task = task.kind(), "processing entry");
        let job = run_entry(
            task,
            entry,
            self.backoff.clone(),
            self.status_backoff.clone(),
            self.max_status_attempts,
            self.status_writer.clone(),
            self.stats.clone(),
            done,
        );
        self.scheduler.push(&key, job).await;
        disposition
    }

    fn drop_record(&self, done: oneshot::Sender<Disposition>, reason: String) {
        self.stats.dropped.fetch_add(1, Ordering::SeqCst);
        let _ = done.send(Disposition::Dropped { reason });
    }

    /// Wait until every submitted record has reached a terminal state.
    pub async fn drain(&self) {
        self.scheduler.idle().await;
    }

    /// The ordering scheduler, for introspection.
    pub fn scheduler(&self) -> &KeyScheduler {
        &self.scheduler
    }

    /// Snapshot of the processor counters.
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            submitted: self.stats.submitted.load(Ordering::SeqCst),
            completed: self.stats.completed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            dropped: self.stats.dropped.load(Ordering::SeqCst),
            transfer_retries: self.stats.transfer_retries.load(Ordering::SeqCst),
            status_retries: self.stats.status_retries.load(Ordering::SeqCst),
            status_write_failures: self.stats.status_write_failures.load(Ordering::SeqCst),
        }
    }
}

/// Run one record to its terminal state: transfer retry loop, terminal
/// entry derivation, status write, disposition.
#[allow(clippy::too_many_arguments)]
async fn run_entry(
    task: Arc<ReplicationTask>,
    entry: ReplicationEntry,
    backoff: BackoffConfig,
    status_backoff: BackoffConfig,
    max_status_attempts: u32,
    status_writer: Option<Arc<dyn StatusWriter>>,
    stats: Arc<StatsInner>,
    done: oneshot::Sender<Disposition>,
) {
    let mut ctx = BackoffCtx::new(&backoff);
    let outcome = loop {
        match task.process(&entry).await {
            Ok(()) => break Ok(()),
            Err(err) if err.is_retryable() => {
                stats.transfer_retries.fetch_add(1, Ordering::SeqCst);
                let delay = ctx.duration();
                tracing::warn!(
                    entry = %entry.log_info(),
                    error = %err,
                    retry_delay_ms = delay.as_millis() as u64,
                    "temporary failure to replicate object, scheduled retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => break Err(err),
        }
    };

    let disposition = match outcome {
        Ok(()) => {
            tracing::debug!(
                entry = %entry.log_info(),
                "replication succeeded for object, updating source replication status to COMPLETED"
            );
            stats.completed.fetch_add(1, Ordering::SeqCst);
            update_status(
                entry.to_completed_entry(),
                &status_backoff,
                max_status_attempts,
                status_writer,
                &stats,
            )
            .await;
            Disposition::Completed
        }
        Err(err) => {
            tracing::warn!(
                entry = %entry.log_info(),
                error = %err,
                "replication failed permanently for object, updating replication status to FAILED"
            );
            stats.failed.fetch_add(1, Ordering::SeqCst);
            update_status(
                entry.to_failed_entry(),
                &status_backoff,
                max_status_attempts,
                status_writer,
                &stats,
            )
            .await;
            Disposition::Failed
        }
    };
    // The consumer side may have gone away; the terminal state still holds.
    let _ = done.send(disposition);
}

/// Write the terminal replication status onto the source, with its own
/// bounded backoff loop. A transient status failure never re-triggers the
/// data transfer, and exhaustion ends in log-and-continue so the pipeline
/// never deadlocks on status propagation.
async fn update_status(
    entry: ReplicationEntry,
    backoff: &BackoffConfig,
    max_attempts: u32,
    status_writer: Option<Arc<dyn StatusWriter>>,
    stats: &StatsInner,
) {
    let Some(writer) = status_writer else {
        tracing::info!(
            entry = %entry.log_info(),
            status = ?entry.replication_status,
            "replication status update skipped"
        );
        return;
    };
    let blob = match entry.metadata_blob() {
        Ok(blob) => blob,
        Err(err) => {
            stats.status_write_failures.fetch_add(1, Ordering::SeqCst);
            tracing::error!(entry = %entry.log_info(), error = %err, "cannot serialize status metadata");
            return;
        }
    };

    let mut ctx = BackoffCtx::new(backoff);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match writer
            .put_metadata(&entry.bucket, &entry.object_key, &blob)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    entry = %entry.log_info(),
                    status = ?entry.replication_status,
                    "replication status updated"
                );
                return;
            }
            Err(err) if err.is_retryable() && attempts < max_attempts => {
                stats.status_retries.fetch_add(1, Ordering::SeqCst);
                let delay = ctx.duration();
                tracing::warn!(
                    entry = %entry.log_info(),
                    error = %err,
                    retry_delay_ms = delay.as_millis() as u64,
                    "scheduled retry of replication status update"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                stats.status_write_failures.fetch_add(1, Ordering::SeqCst);
                tracing::error!(
                    entry = %entry.log_info(),
                    error = %err,
                    attempts,
                    "an error occurred when writing replication status, giving up"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use siphon_core::config::{AccountIdentity, AuthConfig, EndpointConfig};
    use siphon_core::entry::ReplicationStatus;

    const ROLES: &str = "arn:aws:iam::111111111111:role/src,arn:aws:iam::222222222222:role/dst";

    fn test_config(echo_mode: bool) -> ReplicationConfig {
        let fast = BackoffConfig {
            min_ms: 1,
            max_ms: 5,
            factor: 1.5,
            jitter: 0.0,
        };
        ReplicationConfig {
            topic: "siphon-replication".to_string(),
            group_id: "siphon-repl-group".to_string(),
            source: EndpointConfig {
                endpoint: "https://src:8000".to_string(),
                auth: AuthConfig::Account {
                    account: identity("arn:aws:iam::111111111111:root"),
                },
            },
            destination: EndpointConfig {
                endpoint: "https://dst:8000".to_string(),
                auth: AuthConfig::Account {
                    account: identity("arn:aws:iam::222222222222:root"),
                },
            },
            backoff: fast.clone(),
            status_backoff: fast,
            max_status_attempts: 3,
            echo_mode,
        }
    }

    fn identity(arn: &str) -> AccountIdentity {
        AccountIdentity {
            name: "acct".to_string(),
            arn: arn.to_string(),
            canonical_id: "dest-canon".to_string(),
            display_name: "Destination".to_string(),
            access_key: "AK".to_string(),
            secret_key: "SK".to_string(),
            admin: true,
        }
    }

    struct Rig {
        source: Arc<MemoryStore>,
        target: Arc<MemoryStore>,
        backend: Arc<MemoryStore>,
        processor: Processor,
    }

    fn rig(echo_mode: bool) -> Rig {
        let source = Arc::new(MemoryStore::new());
        let target = Arc::new(MemoryStore::new());
        let backend = Arc::new(MemoryStore::new());
        source.set_replication_roles("b1", ROLES);
        source.put_object_bytes("b1", "o1", Some("v1"), Bytes::from_static(b"data"));

        let processor = Processor::new(
            &test_config(echo_mode),
            ProcessorClients {
                source: source.clone(),
                target: target.clone(),
                status_writer: Some(source.clone()),
                external: Some(backend.clone()),
                broker: None,
            },
        )
        .unwrap();
        Rig {
            source,
            target,
            backend,
            processor,
        }
    }

    fn pending_entry() -> ReplicationEntry {
        ReplicationEntry {
            bucket: "b1".to_string(),
            object_key: "o1".to_string(),
            version_id: Some("v1".to_string()),
            kind: RecordKind::Object,
            replication_status: Some(ReplicationStatus::Pending),
            storage_backend: StorageBackend::Default,
            owner_canonical_id: None,
            owner_display_name: None,
            content_length: 4,
            content_md5: None,
            location: None,
            replication_roles: Some(ROLES.to_string()),
        }
    }

    fn record_for(entry: &ReplicationEntry) -> RawRecord {
        RawRecord {
            key: format!("{}/{}", entry.bucket, entry.object_key),
            value: entry.metadata_blob().unwrap(),
        }
    }

    mod happy_path {
        use super::*;

        #[tokio::test]
        async fn test_pending_object_completes_and_status_is_written() {
            let rig = rig(false);
            let rx = rig.processor.submit(record_for(&pending_entry())).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);

            assert_eq!(&rig.target.object_bytes("b1", "o1").unwrap()[..], b"data");
            let status = rig.source.entry_for("b1", "o1").unwrap();
            assert_eq!(
                status.replication_status,
                Some(ReplicationStatus::Completed)
            );

            let stats = rig.processor.stats();
            assert_eq!(stats.completed, 1);
            assert_eq!(stats.failed, 0);
            assert_eq!(stats.transfer_retries, 0);
        }

        #[tokio::test]
        async fn test_external_backend_entry_routes_to_foreign_backend() {
            let rig = rig(false);
            let mut entry = pending_entry();
            entry.storage_backend = StorageBackend::External;

            let rx = rig.processor.submit(record_for(&entry)).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);

            assert_eq!(&rig.backend.object_bytes("b1", "o1").unwrap()[..], b"data");
            let written = rig.target.entry_for("b1", "o1").unwrap();
            assert_eq!(written.location.as_deref(), Some("ext://b1/o1"));
        }
    }

    mod role_auth {
        use super::*;
        use crate::auth::{AccountAttributes, Credentials};
        use async_trait::async_trait;
        use std::sync::atomic::AtomicU32;

        #[derive(Default)]
        struct CountingBroker {
            assume_calls: AtomicU32,
        }

        #[async_trait]
        impl CredentialBroker for CountingBroker {
            async fn assume_role(
                &self,
                role_arn: &str,
            ) -> Result<Credentials, ReplicationError> {
                self.assume_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Credentials {
                    access_key: format!("role-{role_arn}"),
                    secret_key: "secret".to_string(),
                    session_token: Some("token".to_string()),
                })
            }

            async fn lookup_account(
                &self,
                _account_id: &str,
            ) -> Result<Option<AccountAttributes>, ReplicationError> {
                Ok(Some(AccountAttributes {
                    canonical_id: "remote-canon".to_string(),
                    display_name: "Remote".to_string(),
                }))
            }
        }

        #[tokio::test]
        async fn test_role_destination_assumes_role_during_transfer() {
            let source = Arc::new(MemoryStore::new());
            let target = Arc::new(MemoryStore::new());
            source.set_replication_roles("b1", ROLES);
            source.put_object_bytes("b1", "o1", Some("v1"), Bytes::from_static(b"data"));
            let broker = Arc::new(CountingBroker::default());

            let mut config = test_config(false);
            config.destination.auth = AuthConfig::Role {
                broker_endpoint: "vault:8500".to_string(),
                admin: false,
            };
            let processor = Processor::new(
                &config,
                ProcessorClients {
                    source: source.clone(),
                    target: target.clone(),
                    status_writer: Some(source.clone()),
                    external: None,
                    broker: Some(broker.clone()),
                },
            )
            .unwrap();

            let rx = processor.submit(record_for(&pending_entry())).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);

            // The transfer authenticated with broker-assumed credentials.
            assert_eq!(broker.assume_calls.load(Ordering::SeqCst), 1);
            let expected = "role-arn:aws:iam::222222222222:role/dst".to_string();
            assert_eq!(target.credential_keys(), vec![expected.clone(), expected]);
        }
    }

    mod retry_loop {
        use super::*;

        #[tokio::test]
        async fn test_fails_twice_transiently_then_succeeds() {
            let rig = rig(false);
            for _ in 0..2 {
                rig.source.fail_next(
                    "get_bucket_replication",
                    ReplicationError::Network {
                        reason: "connection reset".to_string(),
                    },
                );
            }

            let rx = rig.processor.submit(record_for(&pending_entry())).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);

            // Exactly three task invocations: two transient failures, one
            // success.
            assert_eq!(rig.source.calls("get_bucket_replication"), 3);
            let status = rig.source.entry_for("b1", "o1").unwrap();
            assert_eq!(
                status.replication_status,
                Some(ReplicationStatus::Completed)
            );
            assert_eq!(rig.processor.stats().transfer_retries, 2);
        }

        #[tokio::test]
        async fn test_single_role_fails_permanently_after_one_attempt() {
            let rig = rig(false);
            let mut entry = pending_entry();
            entry.replication_roles = Some("arn:only-one".to_string());

            let rx = rig.processor.submit(record_for(&entry)).await;
            assert_eq!(rx.await.unwrap(), Disposition::Failed);

            // The malformed role pair is rejected before any backend call.
            assert_eq!(rig.source.calls("get_bucket_replication"), 0);
            let status = rig.source.entry_for("b1", "o1").unwrap();
            assert_eq!(status.replication_status, Some(ReplicationStatus::Failed));
            assert_eq!(rig.processor.stats().transfer_retries, 0);
        }

        #[tokio::test]
        async fn test_permanent_transport_error_marks_failed() {
            let rig = rig(false);
            rig.source.fail_next(
                "get_object",
                ReplicationError::AccessDenied {
                    reason: "signature mismatch".to_string(),
                },
            );

            let rx = rig.processor.submit(record_for(&pending_entry())).await;
            assert_eq!(rx.await.unwrap(), Disposition::Failed);
            assert_eq!(rig.processor.stats().failed, 1);
        }
    }

    mod status_write {
        use super::*;

        #[tokio::test]
        async fn test_transient_status_failure_is_retried_independently() {
            let rig = rig(false);
            rig.source.fail_next(
                "status_put_metadata",
                ReplicationError::UpstreamStatus {
                    code: 503,
                    reason: "unavailable".to_string(),
                },
            );

            let rx = rig.processor.submit(record_for(&pending_entry())).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);

            // One transfer, two status attempts; the status retry never
            // re-triggered the data transfer.
            assert_eq!(rig.source.calls("get_bucket_replication"), 1);
            assert_eq!(rig.source.calls("status_put_metadata"), 2);
            let stats = rig.processor.stats();
            assert_eq!(stats.status_retries, 1);
            assert_eq!(stats.status_write_failures, 0);
        }

        #[tokio::test]
        async fn test_status_exhaustion_still_resolves_disposition() {
            let rig = rig(false);
            // max_status_attempts is 3 in the test config.
            for _ in 0..3 {
                rig.source.fail_next(
                    "status_put_metadata",
                    ReplicationError::Network {
                        reason: "reset".to_string(),
                    },
                );
            }

            let rx = rig.processor.submit(record_for(&pending_entry())).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);
            let stats = rig.processor.stats();
            assert_eq!(stats.status_write_failures, 1);
            assert_eq!(rig.source.calls("status_put_metadata"), 3);
        }

        #[tokio::test]
        async fn test_permanent_status_failure_gives_up_immediately() {
            let rig = rig(false);
            rig.source.fail_next(
                "status_put_metadata",
                ReplicationError::AccessDenied {
                    reason: "denied".to_string(),
                },
            );

            let rx = rig.processor.submit(record_for(&pending_entry())).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);
            assert_eq!(rig.source.calls("status_put_metadata"), 1);
            assert_eq!(rig.processor.stats().status_write_failures, 1);
        }

        #[tokio::test]
        async fn test_missing_status_writer_skips_update() {
            let source = Arc::new(MemoryStore::new());
            source.set_replication_roles("b1", ROLES);
            source.put_object_bytes("b1", "o1", Some("v1"), Bytes::from_static(b"data"));
            let target = Arc::new(MemoryStore::new());
            let processor = Processor::new(
                &test_config(false),
                ProcessorClients {
                    source: source.clone(),
                    target,
                    status_writer: None,
                    external: None,
                    broker: None,
                },
            )
            .unwrap();

            let rx = processor.submit(record_for(&pending_entry())).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);
            assert_eq!(source.calls("status_put_metadata"), 0);
        }
    }

    mod filtering {
        use super::*;

        #[tokio::test]
        async fn test_malformed_record_is_dropped_immediately() {
            let rig = rig(false);
            let rx = rig
                .processor
                .submit(RawRecord {
                    key: "b1/o1".to_string(),
                    value: "{not json".to_string(),
                })
                .await;
            assert!(matches!(rx.await.unwrap(), Disposition::Dropped { .. }));
            assert_eq!(rig.source.calls("get_bucket_replication"), 0);
            assert_eq!(rig.processor.stats().dropped, 1);
        }

        #[tokio::test]
        async fn test_non_pending_entry_is_dropped() {
            let rig = rig(false);
            let entry = pending_entry().to_completed_entry();
            let rx = rig.processor.submit(record_for(&entry)).await;
            let disposition = rx.await.unwrap();
            assert_eq!(
                disposition,
                Disposition::Dropped {
                    reason: "replication status not PENDING".to_string()
                }
            );
            // Task never invoked for an already-terminal entry.
            assert_eq!(rig.source.calls("get_bucket_replication"), 0);
        }

        #[tokio::test]
        async fn test_internal_marker_is_dropped() {
            let rig = rig(false);
            let mut entry = pending_entry();
            entry.object_key = "\u{1}internal".to_string();
            let rx = rig.processor.submit(record_for(&entry)).await;
            assert!(matches!(rx.await.unwrap(), Disposition::Dropped { .. }));
        }

        #[tokio::test]
        async fn test_external_entry_without_backend_is_dropped() {
            let source = Arc::new(MemoryStore::new());
            source.set_replication_roles("b1", ROLES);
            let processor = Processor::new(
                &test_config(false),
                ProcessorClients {
                    source: source.clone(),
                    target: Arc::new(MemoryStore::new()),
                    status_writer: Some(source.clone()),
                    external: None,
                    broker: None,
                },
            )
            .unwrap();

            let mut entry = pending_entry();
            entry.storage_backend = StorageBackend::External;
            let rx = processor.submit(record_for(&entry)).await;
            assert!(matches!(rx.await.unwrap(), Disposition::Dropped { .. }));
        }
    }

    mod echo_mode {
        use super::*;

        #[tokio::test]
        async fn test_bucket_entry_without_echo_is_acked_without_task() {
            let rig = rig(false);
            let mut entry = pending_entry();
            entry.kind = RecordKind::Bucket;

            let rx = rig.processor.submit(record_for(&entry)).await;
            assert_eq!(
                rx.await.unwrap(),
                Disposition::Dropped {
                    reason: "bucket entry without echo mode".to_string()
                }
            );
            assert_eq!(rig.source.calls("get_bucket_replication"), 0);
            assert_eq!(rig.source.calls("status_put_metadata"), 0);
        }

        #[tokio::test]
        async fn test_bucket_entry_with_echo_loops_back() {
            let rig = rig(true);
            let mut entry = pending_entry();
            entry.kind = RecordKind::Bucket;

            let rx = rig.processor.submit(record_for(&entry)).await;
            assert_eq!(rx.await.unwrap(), Disposition::Completed);
            // Echoed control event plus the COMPLETED status write.
            assert_eq!(rig.source.calls("status_put_metadata"), 2);
        }

        #[tokio::test]
        async fn test_echo_without_status_writer_is_config_error() {
            let source = Arc::new(MemoryStore::new());
            let err = Processor::new(
                &test_config(true),
                ProcessorClients {
                    source,
                    target: Arc::new(MemoryStore::new()),
                    status_writer: None,
                    external: None,
                    broker: None,
                },
            )
            .unwrap_err();
            assert!(matches!(err, ReplicationError::Config { .. }));
        }
    }

    mod ordering {
        use super::*;

        #[tokio::test]
        async fn test_same_key_successor_waits_for_retry_loop() {
            let rig = rig(false);
            for _ in 0..2 {
                rig.source.fail_next(
                    "get_bucket_replication",
                    ReplicationError::Network {
                        reason: "reset".to_string(),
                    },
                );
            }

            let first = rig.processor.submit(record_for(&pending_entry())).await;
            let mut second = rig.processor.submit(record_for(&pending_entry())).await;

            // While the first record is in its retry loop, the second holds.
            assert_eq!(second.try_recv(), Err(oneshot::error::TryRecvError::Empty));

            assert_eq!(first.await.unwrap(), Disposition::Completed);
            assert_eq!(second.await.unwrap(), Disposition::Completed);
            // Both ran: 3 attempts for the first, 1 for the second.
            assert_eq!(rig.source.calls("get_bucket_replication"), 4);
        }

        #[tokio::test]
        async fn test_distinct_keys_do_not_serialize() {
            let rig = rig(false);
            rig.source.set_replication_roles("b2", ROLES);
            rig.source
                .put_object_bytes("b2", "o2", None, Bytes::from_static(b"other"));
            // Key b1/o1 is stuck in a long transient-retry loop.
            for _ in 0..50 {
                rig.source.fail_next(
                    "get_object",
                    ReplicationError::Network {
                        reason: "reset".to_string(),
                    },
                );
            }

            let _slow = rig.processor.submit(record_for(&pending_entry())).await;

            let mut other = pending_entry();
            other.bucket = "b2".to_string();
            other.object_key = "o2".to_string();
            other.version_id = None;
            let fast = rig.processor.submit(record_for(&other)).await;

            let disposition =
                tokio::time::timeout(std::time::Duration::from_secs(5), fast)
                    .await
                    .expect("fast key blocked behind slow key")
                    .unwrap();
            assert_eq!(disposition, Disposition::Completed);
        }
    }
}
