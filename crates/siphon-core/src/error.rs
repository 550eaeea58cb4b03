//! Error types for the replication subsystem.
//!
//! Retryability is classified exactly once, on the error itself; tasks never
//! retry internally. The processor consults [`ReplicationError::is_retryable`]
//! at its outcome boundary to decide between backoff-retry and a terminal
//! FAILED status.

use thiserror::Error;

/// Errors that can occur while replicating an entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// The inbound log record could not be parsed into a replication entry.
    /// Never retried: the record is acknowledged and dropped to avoid a
    /// poison-pill stall.
    #[error("malformed entry: {reason}")]
    MalformedEntry {
        /// What was wrong with the record.
        reason: String,
    },

    /// The target account does not match the configured identity, or the
    /// credential broker lookup came back empty. Permanent.
    #[error("account not found: {account_id}")]
    AccountNotFound {
        /// The account ID that failed to resolve.
        account_id: String,
    },

    /// Malformed replication-role configuration or a broken internal
    /// invariant. Permanent.
    #[error("internal error: {reason}")]
    InternalError {
        /// Description of the violated expectation.
        reason: String,
    },

    /// Network-level transport failure (connection reset, DNS, broken
    /// stream). Transient.
    #[error("network error: {reason}")]
    Network {
        /// Description of the network failure.
        reason: String,
    },

    /// A backend call exceeded its per-attempt deadline. Transient.
    #[error("timeout during {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// The backend answered with an HTTP-style status code. Retryable only
    /// for server-side (5xx) codes.
    #[error("upstream returned {code}: {reason}")]
    UpstreamStatus {
        /// Status code returned by the backend.
        code: u16,
        /// Backend-provided reason, if any.
        reason: String,
    },

    /// Authentication or authorization rejection from a backend. Permanent.
    #[error("access denied: {reason}")]
    AccessDenied {
        /// Rejection detail.
        reason: String,
    },

    /// The backend rejected the request as invalid. Permanent.
    #[error("validation error: {reason}")]
    Validation {
        /// Rejection detail.
        reason: String,
    },

    /// Invalid or incomplete configuration, detected at construction time.
    #[error("configuration error: {reason}")]
    Config {
        /// What is missing or inconsistent.
        reason: String,
    },

    /// The engine was shut down while work was pending.
    #[error("replication engine shut down")]
    Shutdown,
}

impl ReplicationError {
    /// Whether this failure is transient and worth retrying with backoff.
    ///
    /// Transient: network faults, timeouts, 5xx upstream codes. Everything
    /// else is terminal and ends in a FAILED status (or a drop, for
    /// malformed entries).
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Network { .. } => true,
            ReplicationError::Timeout { .. } => true,
            ReplicationError::UpstreamStatus { code, .. } => *code >= 500,
            ReplicationError::MalformedEntry { .. } => false,
            ReplicationError::AccountNotFound { .. } => false,
            ReplicationError::InternalError { .. } => false,
            ReplicationError::AccessDenied { .. } => false,
            ReplicationError::Validation { .. } => false,
            ReplicationError::Config { .. } => false,
            ReplicationError::Shutdown => false,
        }
    }
}
