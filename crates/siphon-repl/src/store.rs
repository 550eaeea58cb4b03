//! Narrow interfaces to the external storage systems.
//!
//! The engine never implements the object-storage data/metadata APIs; it
//! consumes them through these seams. Object data moves through in-process
//! mpsc channels, so a slow destination applies natural backpressure to the
//! source read without buffering whole objects.

use crate::auth::Credentials;
use async_trait::async_trait;
use bytes::Bytes;
use siphon_core::entry::ReplicationEntry;
use siphon_core::error::ReplicationError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A stream of object data chunks; a failed chunk aborts the transfer.
pub type ObjectData = mpsc::Receiver<Result<Bytes, ReplicationError>>;

/// Wrap a single in-memory payload as an [`ObjectData`] stream.
pub fn object_data_from_bytes(data: Bytes) -> ObjectData {
    object_data_from_chunks(vec![Ok(data)])
}

/// Wrap a chunk script (data or mid-stream errors) as an [`ObjectData`] stream.
pub fn object_data_from_chunks(chunks: Vec<Result<Bytes, ReplicationError>>) -> ObjectData {
    let (tx, rx) = mpsc::channel(chunks.len().max(1));
    for chunk in chunks {
        // Capacity covers every chunk, so try_send cannot fail here.
        let _ = tx.try_send(chunk);
    }
    rx
}

/// Drain an [`ObjectData`] stream into one buffer, propagating stream errors.
pub async fn read_all(mut body: ObjectData) -> Result<Bytes, ReplicationError> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.recv().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(buf))
}

/// Read-side operations against the source storage system.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetch the bucket's replication configuration role string
    /// (two comma-joined role identifiers).
    async fn get_bucket_replication(&self, bucket: &str) -> Result<String, ReplicationError>;

    /// Open a read stream for one object version.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectData, ReplicationError>;
}

/// One destination data write.
pub struct PutDataRequest {
    /// Destination bucket.
    pub bucket: String,
    /// Destination object key.
    pub key: String,
    /// Destination owner canonical ID.
    pub canonical_id: Option<String>,
    /// Payload size in bytes.
    pub content_length: u64,
    /// Payload MD5, when the source recorded one.
    pub content_md5: Option<String>,
    /// Credential handle authenticating the write.
    pub credentials: Credentials,
    /// The data stream read from the source.
    pub body: ObjectData,
}

/// Write-side operations against the destination storage system.
#[async_trait]
pub trait ReplicaTarget: Send + Sync {
    /// Stream object data into the destination; returns the storage location.
    async fn put_data(&self, request: PutDataRequest) -> Result<String, ReplicationError>;

    /// Write the destination-bound metadata blob.
    async fn put_metadata(
        &self,
        bucket: &str,
        key: &str,
        blob: &str,
        credentials: &Credentials,
    ) -> Result<(), ReplicationError>;
}

/// Source-side metadata writer used for replication status updates.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Write the updated source metadata blob carrying the terminal status.
    async fn put_metadata(
        &self,
        bucket: &str,
        key: &str,
        blob: &str,
    ) -> Result<(), ReplicationError>;
}

/// Result of a foreign-backend data placement; tokens are opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePlacement {
    /// Backend-reported storage location.
    pub location: String,
    /// Backend-reported version token, if any.
    pub version_token: Option<String>,
}

/// A foreign storage backend with its own put semantics.
#[async_trait]
pub trait ExternalBackend: Send + Sync {
    /// Place object data on the foreign backend.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectData,
        content_length: u64,
        credentials: &Credentials,
    ) -> Result<RemotePlacement, ReplicationError>;
}

/// In-process store implementing every seam over hash maps, with scripted
/// failure injection. Serves the echo/validation mode and the test suites.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Bytes>>,
    metadata: Mutex<HashMap<String, String>>,
    replication_roles: Mutex<HashMap<String, String>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ReplicationError>>>,
    calls: Mutex<HashMap<&'static str, u64>>,
    credential_keys: Mutex<Vec<String>>,
}

fn object_id(bucket: &str, key: &str, version_id: Option<&str>) -> String {
    match version_id {
        Some(v) => format!("{bucket}/{key}?versionId={v}"),
        None => format!("{bucket}/{key}"),
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the replication role string for a bucket.
    pub fn set_replication_roles(&self, bucket: &str, roles: &str) {
        self.replication_roles
            .lock()
            .expect("roles lock")
            .insert(bucket.to_string(), roles.to_string());
    }

    /// Seed an object payload.
    pub fn put_object_bytes(&self, bucket: &str, key: &str, version_id: Option<&str>, data: Bytes) {
        self.objects
            .lock()
            .expect("objects lock")
            .insert(object_id(bucket, key, version_id), data);
    }

    /// Stored payload for an object, if any.
    pub fn object_bytes(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .expect("objects lock")
            .get(&object_id(bucket, key, None))
            .cloned()
    }

    /// Stored metadata blob for an object, if any.
    pub fn metadata_for(&self, bucket: &str, key: &str) -> Option<String> {
        self.metadata
            .lock()
            .expect("metadata lock")
            .get(&object_id(bucket, key, None))
            .cloned()
    }

    /// Stored metadata parsed back into an entry, if present and valid.
    pub fn entry_for(&self, bucket: &str, key: &str) -> Option<ReplicationEntry> {
        self.metadata_for(bucket, key)
            .and_then(|blob| ReplicationEntry::from_record_value(&blob).ok())
    }

    /// Script the next call to `op` to fail with `err`. Scripted failures
    /// are consumed in FIFO order, one per call.
    pub fn fail_next(&self, op: &'static str, err: ReplicationError) {
        self.failures
            .lock()
            .expect("failures lock")
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Number of calls made to `op` so far.
    pub fn calls(&self, op: &str) -> u64 {
        *self.calls.lock().expect("calls lock").get(op).unwrap_or(&0)
    }

    /// Access keys presented on authenticated writes, in call order.
    pub fn credential_keys(&self) -> Vec<String> {
        self.credential_keys
            .lock()
            .expect("credential keys lock")
            .clone()
    }

    fn record_credentials(&self, credentials: &Credentials) {
        self.credential_keys
            .lock()
            .expect("credential keys lock")
            .push(credentials.access_key.clone());
    }

    fn record_call(&self, op: &'static str) -> Result<(), ReplicationError> {
        *self.calls.lock().expect("calls lock").entry(op).or_insert(0) += 1;
        let mut failures = self.failures.lock().expect("failures lock");
        if let Some(queue) = failures.get_mut(op) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn get_bucket_replication(&self, bucket: &str) -> Result<String, ReplicationError> {
        self.record_call("get_bucket_replication")?;
        self.replication_roles
            .lock()
            .expect("roles lock")
            .get(bucket)
            .cloned()
            .ok_or_else(|| ReplicationError::InternalError {
                reason: format!("no replication configuration for bucket {bucket}"),
            })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectData, ReplicationError> {
        self.record_call("get_object")?;
        let data = self
            .objects
            .lock()
            .expect("objects lock")
            .get(&object_id(bucket, key, version_id))
            .cloned()
            .ok_or_else(|| ReplicationError::UpstreamStatus {
                code: 404,
                reason: format!("no such object {}", object_id(bucket, key, version_id)),
            })?;
        Ok(object_data_from_bytes(data))
    }
}

#[async_trait]
impl ReplicaTarget for MemoryStore {
    async fn put_data(&self, request: PutDataRequest) -> Result<String, ReplicationError> {
        self.record_call("put_data")?;
        self.record_credentials(&request.credentials);
        let data = read_all(request.body).await?;
        let id = object_id(&request.bucket, &request.key, None);
        self.objects
            .lock()
            .expect("objects lock")
            .insert(id.clone(), data);
        Ok(format!("mem://{id}"))
    }

    async fn put_metadata(
        &self,
        bucket: &str,
        key: &str,
        blob: &str,
        credentials: &Credentials,
    ) -> Result<(), ReplicationError> {
        self.record_call("put_metadata")?;
        self.record_credentials(credentials);
        self.metadata
            .lock()
            .expect("metadata lock")
            .insert(object_id(bucket, key, None), blob.to_string());
        Ok(())
    }
}

#[async_trait]
impl StatusWriter for MemoryStore {
    async fn put_metadata(
        &self,
        bucket: &str,
        key: &str,
        blob: &str,
    ) -> Result<(), ReplicationError> {
        self.record_call("status_put_metadata")?;
        self.metadata
            .lock()
            .expect("metadata lock")
            .insert(object_id(bucket, key, None), blob.to_string());
        Ok(())
    }
}

#[async_trait]
impl ExternalBackend for MemoryStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectData,
        _content_length: u64,
        credentials: &Credentials,
    ) -> Result<RemotePlacement, ReplicationError> {
        self.record_call("external_put_object")?;
        self.record_credentials(credentials);
        let data = read_all(body).await?;
        let id = object_id(bucket, key, None);
        self.objects
            .lock()
            .expect("objects lock")
            .insert(id.clone(), data);
        Ok(RemotePlacement {
            location: format!("ext://{id}"),
            version_token: Some(format!("ext-v-{}", self.calls("external_put_object"))),
        })
    }
}
