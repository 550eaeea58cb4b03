#![warn(missing_docs)]

//! Siphon core: replication entry model, error taxonomy, configuration, backoff

pub mod backoff;
pub mod config;
pub mod entry;
pub mod error;

pub use backoff::{BackoffConfig, BackoffCtx};
pub use config::{AccountIdentity, AuthConfig, EndpointConfig, ReplicationConfig};
pub use entry::{RecordKind, ReplicationEntry, ReplicationStatus, StorageBackend};
pub use error::ReplicationError;
