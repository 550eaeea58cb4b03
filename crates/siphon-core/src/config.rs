//! Configuration surface for the replication engine.
//!
//! Auth variant selection (static account vs. assumed role) is driven purely
//! by configuration, never by entry content. Echo mode is validated at
//! configuration time: it requires administrative credentials on both the
//! source and the destination side.

use crate::backoff::BackoffConfig;
use crate::error::ReplicationError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A statically configured account identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountIdentity {
    /// Human-readable account name.
    pub name: String,
    /// Account ARN; the account ID is derived from it.
    pub arn: String,
    /// Canonical ID stamped onto destination-bound entries.
    pub canonical_id: String,
    /// Display name stamped onto destination-bound entries.
    pub display_name: String,
    /// Access key for outbound transfer calls.
    pub access_key: String,
    /// Secret key for outbound transfer calls.
    pub secret_key: String,
    /// Whether these are administrative credentials (required by echo mode).
    #[serde(default)]
    pub admin: bool,
}

impl AccountIdentity {
    /// Fail fast if a required identity field is absent.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        for (field, value) in [
            ("arn", &self.arn),
            ("canonicalId", &self.canonical_id),
            ("displayName", &self.display_name),
        ] {
            if value.is_empty() {
                return Err(ReplicationError::Config {
                    reason: format!("account {:?} has no {field} defined", self.name),
                });
            }
        }
        Ok(())
    }
}

/// How an endpoint authenticates: a fixed account or a broker-assumed role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum AuthConfig {
    /// Statically configured account identity.
    Account {
        /// The configured identity record.
        account: AccountIdentity,
    },
    /// Dynamically assumed role via a credential broker.
    Role {
        /// Credential broker endpoint, as `host:port`.
        broker_endpoint: String,
        /// Whether the broker issues administrative credentials.
        #[serde(default)]
        admin: bool,
    },
}

impl AuthConfig {
    /// Whether this side carries administrative credentials.
    pub fn is_admin(&self) -> bool {
        match self {
            AuthConfig::Account { account } => account.admin,
            AuthConfig::Role { admin, .. } => *admin,
        }
    }

    /// Validate construction-time requirements of the variant.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        match self {
            AuthConfig::Account { account } => account.validate(),
            AuthConfig::Role { broker_endpoint, .. } => {
                if broker_endpoint.is_empty() {
                    return Err(ReplicationError::Config {
                        reason: "role auth requires a broker endpoint".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// One storage endpoint (source or destination) and its auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Endpoint URL, e.g. `https://storage.example.com:8000`.
    pub endpoint: String,
    /// Authentication settings for this endpoint.
    pub auth: AuthConfig,
}

fn default_max_status_attempts() -> u32 {
    10
}

/// Top-level replication engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConfig {
    /// Work log topic carrying replication entries.
    pub topic: String,
    /// Consumer group identity on the log transport.
    pub group_id: String,
    /// Source endpoint (reads + status writes).
    pub source: EndpointConfig,
    /// Destination endpoint (data + metadata writes).
    pub destination: EndpointConfig,
    /// Backoff parameters for the data-transfer retry loop.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Backoff parameters for the status-write retry loop.
    #[serde(default)]
    pub status_backoff: BackoffConfig,
    /// Attempts before a failing status write is logged and abandoned.
    #[serde(default = "default_max_status_attempts")]
    pub max_status_attempts: u32,
    /// Loopback validation mode; requires admin credentials on both sides.
    #[serde(default)]
    pub echo_mode: bool,
}

impl ReplicationConfig {
    /// Load a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ReplicationError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ReplicationError::Config {
            reason: format!("reading {}: {e}", path.display()),
        })?;
        let config: ReplicationConfig =
            serde_json::from_str(&contents).map_err(|e| ReplicationError::Config {
                reason: format!("parsing {}: {e}", path.display()),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field requirements.
    ///
    /// Echo mode without administrative credentials on both sides is a
    /// configuration-time fatal error.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        self.source.auth.validate()?;
        self.destination.auth.validate()?;
        if self.topic.is_empty() {
            return Err(ReplicationError::Config {
                reason: "replication topic must not be empty".to_string(),
            });
        }
        if self.echo_mode && !(self.source.auth.is_admin() && self.destination.auth.is_admin()) {
            return Err(ReplicationError::Config {
                reason: "echo mode requires administrative credentials on both source and destination".to_string(),
            });
        }
        Ok(())
    }
}
