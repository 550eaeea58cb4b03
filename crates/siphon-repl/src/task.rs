//! Replication task variants: one contract, three transfer strategies.
//!
//! A task attempts one full replication of one entry and reports the outcome
//! as a single `Result`. Tasks never retry internally; failures are
//! classified once, at the processor boundary, through
//! [`ReplicationError::is_retryable`]. Exactly-once completion is structural:
//! each invocation returns exactly one `Result`.

use crate::auth::{account_id_from_arn, AuthResolver, CredentialBroker, Credentials};
use crate::store::{ExternalBackend, PutDataRequest, ReplicaTarget, SourceStore, StatusWriter};
use siphon_core::config::AuthConfig;
use siphon_core::entry::ReplicationEntry;
use siphon_core::error::ReplicationError;
use std::sync::Arc;

/// Split a comma-joined role string into the (source, destination) pair.
///
/// Exactly two non-empty roles are expected; anything else is a permanent
/// configuration fault.
fn split_roles(roles: &str) -> Result<(String, String), ReplicationError> {
    let parts: Vec<&str> = roles.split(',').collect();
    match parts.as_slice() {
        [source, target] if !source.is_empty() && !target.is_empty() => {
            Ok((source.to_string(), target.to_string()))
        }
        _ => Err(ReplicationError::InternalError {
            reason: "expecting two roles separated by a comma in replication configuration"
                .to_string(),
        }),
    }
}

/// Validate the roles recorded on the entry, then re-resolve them against
/// the bucket's live replication configuration.
async fn resolve_roles(
    source: &dyn SourceStore,
    entry: &ReplicationEntry,
) -> Result<(String, String), ReplicationError> {
    let recorded = entry
        .replication_roles
        .as_deref()
        .ok_or_else(|| ReplicationError::InternalError {
            reason: "entry carries no replication roles".to_string(),
        })?;
    split_roles(recorded)?;

    let refreshed = source.get_bucket_replication(&entry.bucket).await?;
    split_roles(&refreshed)
}

/// Shared routing/auth prologue: resolve the destination account from the
/// target role, obtain the credential handle for outbound transfer calls,
/// and derive the destination-bound entry with owner stamped on.
async fn destination_context(
    dest_auth: &AuthConfig,
    broker: Option<Arc<dyn CredentialBroker>>,
    entry: &ReplicationEntry,
    target_role: &str,
) -> Result<(ReplicationEntry, Credentials), ReplicationError> {
    let resolver = AuthResolver::from_config(dest_auth, target_role, broker)?;
    let account_id =
        account_id_from_arn(target_role).ok_or_else(|| ReplicationError::InternalError {
            reason: format!("cannot extract account id from role {target_role}"),
        })?;
    let attrs = resolver.resolve_account(account_id).await?;
    let credentials = resolver.credentials().await?;
    tracing::debug!(
        entry = %entry.log_info(),
        canonical_id = %attrs.canonical_id,
        "setting owner info in target metadata"
    );
    let dest = entry
        .to_destination_entry()
        .with_owner(&attrs.canonical_id, &attrs.display_name);
    Ok((dest, credentials))
}

/// Direct replica: stream data and write metadata to the destination
/// endpoint. Delete markers skip the data phase.
pub struct DirectReplicaTask {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn ReplicaTarget>,
    dest_auth: AuthConfig,
    broker: Option<Arc<dyn CredentialBroker>>,
}

impl DirectReplicaTask {
    /// Create a direct replica task over the given client seams.
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn ReplicaTarget>,
        dest_auth: AuthConfig,
        broker: Option<Arc<dyn CredentialBroker>>,
    ) -> Self {
        Self {
            source,
            target,
            dest_auth,
            broker,
        }
    }

    async fn process(&self, entry: &ReplicationEntry) -> Result<(), ReplicationError> {
        let (_source_role, target_role) = resolve_roles(self.source.as_ref(), entry).await?;
        let (dest, credentials) =
            destination_context(&self.dest_auth, self.broker.clone(), entry, &target_role).await?;

        let dest = if entry.is_delete_marker() {
            dest
        } else {
            tracing::debug!(entry = %entry.log_info(), "getting data");
            let body = self
                .source
                .get_object(&entry.bucket, &entry.object_key, entry.version_id.as_deref())
                .await?;
            tracing::debug!(entry = %entry.log_info(), "putting data");
            let location = self
                .target
                .put_data(PutDataRequest {
                    bucket: dest.bucket.clone(),
                    key: dest.object_key.clone(),
                    canonical_id: dest.owner_canonical_id.clone(),
                    content_length: dest.content_length,
                    content_md5: dest.content_md5.clone(),
                    credentials: credentials.clone(),
                    body,
                })
                .await?;
            dest.with_location(&location)
        };

        tracing::debug!(entry = %dest.log_info(), "putting metadata on target");
        let blob = dest.metadata_blob()?;
        self.target
            .put_metadata(&dest.bucket, &dest.object_key, &blob, &credentials)
            .await
    }
}

/// External-backend replica: same routing and auth steps as the direct
/// replica, but data placement is delegated to a foreign backend whose
/// result location/version token are treated as opaque.
pub struct ExternalBackendTask {
    source: Arc<dyn SourceStore>,
    backend: Arc<dyn ExternalBackend>,
    target: Arc<dyn ReplicaTarget>,
    dest_auth: AuthConfig,
    broker: Option<Arc<dyn CredentialBroker>>,
}

impl ExternalBackendTask {
    /// Create an external-backend replica task over the given seams.
    pub fn new(
        source: Arc<dyn SourceStore>,
        backend: Arc<dyn ExternalBackend>,
        target: Arc<dyn ReplicaTarget>,
        dest_auth: AuthConfig,
        broker: Option<Arc<dyn CredentialBroker>>,
    ) -> Self {
        Self {
            source,
            backend,
            target,
            dest_auth,
            broker,
        }
    }

    async fn process(&self, entry: &ReplicationEntry) -> Result<(), ReplicationError> {
        let (_source_role, target_role) = resolve_roles(self.source.as_ref(), entry).await?;
        let (dest, credentials) =
            destination_context(&self.dest_auth, self.broker.clone(), entry, &target_role).await?;

        let dest = if entry.is_delete_marker() {
            dest
        } else {
            let body = self
                .source
                .get_object(&entry.bucket, &entry.object_key, entry.version_id.as_deref())
                .await?;
            let placement = self
                .backend
                .put_object(
                    &dest.bucket,
                    &dest.object_key,
                    body,
                    dest.content_length,
                    &credentials,
                )
                .await?;
            tracing::debug!(
                entry = %entry.log_info(),
                location = %placement.location,
                version_token = ?placement.version_token,
                "external backend placement"
            );
            dest.with_location(&placement.location)
        };

        let blob = dest.metadata_blob()?;
        self.target
            .put_metadata(&dest.bucket, &dest.object_key, &blob, &credentials)
            .await
    }
}

/// Echo: loopback task for test/validation mode. Bypasses the destination
/// backend entirely and reflects bucket-level control events back onto the
/// source side.
pub struct EchoTask {
    loopback: Arc<dyn StatusWriter>,
}

impl EchoTask {
    /// Create an echo task writing back through the source-side seam.
    pub fn new(loopback: Arc<dyn StatusWriter>) -> Self {
        Self { loopback }
    }

    async fn process(&self, entry: &ReplicationEntry) -> Result<(), ReplicationError> {
        tracing::debug!(entry = %entry.log_info(), "echoing control event");
        let blob = entry.metadata_blob()?;
        self.loopback
            .put_metadata(&entry.bucket, &entry.object_key, &blob)
            .await
    }
}

/// The closed set of transfer strategies, selected by entry classification
/// and configuration, never by runtime type inspection.
pub enum ReplicationTask {
    /// Data + metadata copy to the destination endpoint.
    DirectReplica(DirectReplicaTask),
    /// Delegated data placement on a foreign backend.
    ExternalBackendReplica(ExternalBackendTask),
    /// Loopback for echo/validation mode.
    Echo(EchoTask),
}

impl ReplicationTask {
    /// Attempt one full replication of `entry`.
    pub async fn process(&self, entry: &ReplicationEntry) -> Result<(), ReplicationError> {
        match self {
            ReplicationTask::DirectReplica(task) => task.process(entry).await,
            ReplicationTask::ExternalBackendReplica(task) => task.process(entry).await,
            ReplicationTask::Echo(task) => task.process(entry).await,
        }
    }

    /// Strategy name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationTask::DirectReplica(_) => "direct-replica",
            ReplicationTask::ExternalBackendReplica(_) => "external-backend",
            ReplicationTask::Echo(_) => "echo",
        }
    }
}
