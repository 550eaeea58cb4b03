//! Immutable representation of one source object mutation.
//!
//! A [`ReplicationEntry`] is parsed from one inbound log record and is never
//! mutated in place: every lifecycle step (destination-bound copy, COMPLETED,
//! FAILED) derives a new entry from an existing one, preserving all fields
//! except the ones the step is responsible for changing.

use crate::error::ReplicationError;
use serde::{Deserialize, Serialize};

/// Prefix used by the metadata store for internal marker keys. Entries whose
/// object key starts with this prefix are never replication-eligible.
const INTERNAL_KEY_PREFIX: char = '\u{1}';

/// What kind of mutation the source log recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    /// A regular object write.
    #[default]
    Object,
    /// A bucket-level control event (only meaningful in echo mode).
    Bucket,
    /// A versioned delete marker; replicated as metadata only.
    DeleteMarker,
}

/// Replication lifecycle status recorded against the source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationStatus {
    /// Eligible for replication, not yet attempted.
    Pending,
    /// Replication reached the destination and was recorded.
    Completed,
    /// Replication failed permanently.
    Failed,
}

/// Which transfer strategy the destination requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Direct replica: data + metadata copy to the destination endpoint.
    #[default]
    Default,
    /// Delegate data placement to a foreign storage backend.
    External,
}

/// One parsed source mutation, plus its derived destination/outcome variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationEntry {
    /// Source bucket name.
    pub bucket: String,
    /// Object key within the bucket.
    pub object_key: String,
    /// Opaque encoded version token, if the bucket is versioned.
    #[serde(default)]
    pub version_id: Option<String>,
    /// Kind of mutation.
    #[serde(default)]
    pub kind: RecordKind,
    /// Replication status; absent means not replication-eligible.
    #[serde(default)]
    pub replication_status: Option<ReplicationStatus>,
    /// Transfer strategy selector.
    #[serde(default)]
    pub storage_backend: StorageBackend,
    /// Destination owner canonical ID; set only on destination-bound entries.
    #[serde(default)]
    pub owner_canonical_id: Option<String>,
    /// Destination owner display name; set only on destination-bound entries.
    #[serde(default)]
    pub owner_display_name: Option<String>,
    /// Object payload size in bytes.
    #[serde(default)]
    pub content_length: u64,
    /// Payload MD5, if recorded by the source.
    #[serde(rename = "contentMD5", default)]
    pub content_md5: Option<String>,
    /// Final storage location, filled after a successful data transfer.
    #[serde(default)]
    pub location: Option<String>,
    /// Comma-joined pair of role identifiers (source-side, destination-side).
    #[serde(default)]
    pub replication_roles: Option<String>,
}

impl ReplicationEntry {
    /// Parse an entry from the JSON value of one inbound log record.
    ///
    /// Any JSON syntax error, missing required field, or empty identity
    /// field yields [`ReplicationError::MalformedEntry`], which the
    /// processor acknowledges immediately without retry.
    pub fn from_record_value(value: &str) -> Result<Self, ReplicationError> {
        let entry: ReplicationEntry =
            serde_json::from_str(value).map_err(|e| ReplicationError::MalformedEntry {
                reason: e.to_string(),
            })?;
        if entry.bucket.is_empty() {
            return Err(ReplicationError::MalformedEntry {
                reason: "empty bucket".to_string(),
            });
        }
        if entry.object_key.is_empty() {
            return Err(ReplicationError::MalformedEntry {
                reason: "empty object key".to_string(),
            });
        }
        Ok(entry)
    }

    /// The scheduler's ordering unit: `bucket/objectKey[?versionId=v]`.
    ///
    /// All entries sharing this key are processed strictly in arrival order.
    pub fn canonical_key(&self) -> String {
        match &self.version_id {
            Some(v) => format!("{}/{}?versionId={}", self.bucket, self.object_key, v),
            None => format!("{}/{}", self.bucket, self.object_key),
        }
    }

    /// Derive the destination-bound entry: transferable fields are copied,
    /// outcome-only fields (owner, location) are cleared.
    pub fn to_destination_entry(&self) -> Self {
        let mut dest = self.clone();
        dest.owner_canonical_id = None;
        dest.owner_display_name = None;
        dest.location = None;
        dest
    }

    /// Derive an identical entry with status COMPLETED.
    pub fn to_completed_entry(&self) -> Self {
        let mut entry = self.clone();
        entry.replication_status = Some(ReplicationStatus::Completed);
        entry
    }

    /// Derive an identical entry with status FAILED.
    pub fn to_failed_entry(&self) -> Self {
        let mut entry = self.clone();
        entry.replication_status = Some(ReplicationStatus::Failed);
        entry
    }

    /// Derive an entry with destination owner attributes stamped on.
    pub fn with_owner(&self, canonical_id: &str, display_name: &str) -> Self {
        let mut entry = self.clone();
        entry.owner_canonical_id = Some(canonical_id.to_string());
        entry.owner_display_name = Some(display_name.to_string());
        entry
    }

    /// Derive an entry with the final storage location recorded.
    pub fn with_location(&self, location: &str) -> Self {
        let mut entry = self.clone();
        entry.location = Some(location.to_string());
        entry
    }

    /// Whether this entry is a versioned delete marker.
    pub fn is_delete_marker(&self) -> bool {
        self.kind == RecordKind::DeleteMarker
    }

    /// Whether this entry is still awaiting replication.
    pub fn is_pending(&self) -> bool {
        self.replication_status == Some(ReplicationStatus::Pending)
    }

    /// Whether the object key denotes an internal metadata marker.
    pub fn is_internal_marker(&self) -> bool {
        self.object_key.starts_with(INTERNAL_KEY_PREFIX)
    }

    /// Compact identity string for structured logs.
    pub fn log_info(&self) -> String {
        match &self.version_id {
            Some(v) => format!("{}/{} (version {})", self.bucket, self.object_key, v),
            None => format!("{}/{}", self.bucket, self.object_key),
        }
    }

    /// Serialize the entry as the metadata blob written to a backend.
    pub fn metadata_blob(&self) -> Result<String, ReplicationError> {
        serde_json::to_string(self).map_err(|e| ReplicationError::InternalError {
            reason: format!("metadata serialization: {e}"),
        })
    }
}
