//! Credential and identity resolution for outbound transfers.
//!
//! Two variants, selected by configuration (never by entry content): a
//! statically configured account identity, and a dynamically assumed role
//! obtained from an external credential broker. Both expose the same
//! contract: resolve destination account attributes and hand out an opaque
//! credential handle for transfer calls.

use async_trait::async_trait;
use siphon_core::config::{AccountIdentity, AuthConfig};
use siphon_core::error::ReplicationError;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Opaque credential handle used to authenticate outbound transfer calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Access key ID.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Session token for role-scoped credentials.
    pub session_token: Option<String>,
}

/// Destination account attributes stamped onto destination-bound entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAttributes {
    /// Canonical ID of the account.
    pub canonical_id: String,
    /// Display name of the account.
    pub display_name: String,
}

/// External credential broker: role assumption and canonical-ID lookup.
///
/// Credential refresh is the broker's own contract; stale credentials
/// surface as transfer failures, which are classified retryable.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Assume the given role and return short-lived credentials.
    async fn assume_role(&self, role_arn: &str) -> Result<Credentials, ReplicationError>;

    /// Resolve account attributes by account ID; `None` when unknown.
    async fn lookup_account(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountAttributes>, ReplicationError>;
}

/// Extract the account ID from an ARN (`arn:partition:service:region:id:...`).
pub fn account_id_from_arn(arn: &str) -> Option<&str> {
    arn.split(':').nth(4).filter(|id| !id.is_empty())
}

/// Auth backed by a fixed, fully specified account identity.
#[derive(Debug)]
pub struct StaticAccountAuth {
    identity: AccountIdentity,
}

impl StaticAccountAuth {
    /// Build from a configured identity; fails fast when a required field
    /// (ARN, canonical ID, display name) is absent.
    pub fn new(identity: AccountIdentity) -> Result<Self, ReplicationError> {
        identity.validate()?;
        Ok(Self { identity })
    }

    fn local_account_id(&self) -> Option<&str> {
        account_id_from_arn(&self.identity.arn)
    }

    /// Succeeds only when `account_id` matches the configured account's
    /// ARN-derived ID.
    pub fn resolve_account(
        &self,
        account_id: &str,
    ) -> Result<AccountAttributes, ReplicationError> {
        if self.local_account_id() != Some(account_id) {
            tracing::error!(
                target_account_id = account_id,
                local_account_id = self.local_account_id().unwrap_or(""),
                "target account for replication must match configured destination account ARN"
            );
            return Err(ReplicationError::AccountNotFound {
                account_id: account_id.to_string(),
            });
        }
        Ok(AccountAttributes {
            canonical_id: self.identity.canonical_id.clone(),
            display_name: self.identity.display_name.clone(),
        })
    }

    /// The account's fixed credentials.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            access_key: self.identity.access_key.clone(),
            secret_key: self.identity.secret_key.clone(),
            session_token: None,
        }
    }
}

/// Auth backed by a broker-assumed role; credentials are obtained lazily on
/// first use and cached until the broker rotates them.
pub struct RoleAuth {
    broker: Arc<dyn CredentialBroker>,
    role_arn: String,
    cached: Mutex<Option<Credentials>>,
}

impl RoleAuth {
    /// Build from a broker handle and the role to assume.
    pub fn new(broker: Arc<dyn CredentialBroker>, role_arn: &str) -> Self {
        Self {
            broker,
            role_arn: role_arn.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Look up account attributes through the broker. An empty result maps
    /// to [`ReplicationError::AccountNotFound`]; broker errors propagate.
    pub async fn resolve_account(
        &self,
        account_id: &str,
    ) -> Result<AccountAttributes, ReplicationError> {
        match self.broker.lookup_account(account_id).await? {
            Some(attrs) => Ok(attrs),
            None => Err(ReplicationError::AccountNotFound {
                account_id: account_id.to_string(),
            }),
        }
    }

    /// Assume the role on first use, then serve the cached handle.
    pub async fn credentials(&self) -> Result<Credentials, ReplicationError> {
        let mut cached = self.cached.lock().await;
        if let Some(creds) = cached.as_ref() {
            return Ok(creds.clone());
        }
        let creds = self.broker.assume_role(&self.role_arn).await?;
        *cached = Some(creds.clone());
        Ok(creds)
    }
}

/// Polymorphic credential/identity lookup, closed over its two variants.
pub enum AuthResolver {
    /// Statically configured account identity.
    StaticAccount(StaticAccountAuth),
    /// Dynamically assumed role via a credential broker.
    AssumedRole(RoleAuth),
}

impl std::fmt::Debug for AuthResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaticAccount(auth) => {
                f.debug_tuple("StaticAccount").field(auth).finish()
            }
            Self::AssumedRole(auth) => f
                .debug_struct("AssumedRole")
                .field("role_arn", &auth.role_arn)
                .finish_non_exhaustive(),
        }
    }
}

impl AuthResolver {
    /// Build a resolver for one endpoint from its auth configuration.
    ///
    /// Role-based auth requires a broker handle; its absence is a
    /// configuration error.
    pub fn from_config(
        auth: &AuthConfig,
        role_arn: &str,
        broker: Option<Arc<dyn CredentialBroker>>,
    ) -> Result<Self, ReplicationError> {
        match auth {
            AuthConfig::Account { account } => Ok(AuthResolver::StaticAccount(
                StaticAccountAuth::new(account.clone())?,
            )),
            AuthConfig::Role { .. } => {
                let broker = broker.ok_or_else(|| ReplicationError::Config {
                    reason: "role auth configured but no credential broker available"
                        .to_string(),
                })?;
                Ok(AuthResolver::AssumedRole(RoleAuth::new(broker, role_arn)))
            }
        }
    }

    /// Resolve destination account attributes for the given account ID.
    pub async fn resolve_account(
        &self,
        account_id: &str,
    ) -> Result<AccountAttributes, ReplicationError> {
        match self {
            AuthResolver::StaticAccount(auth) => auth.resolve_account(account_id),
            AuthResolver::AssumedRole(auth) => auth.resolve_account(account_id).await,
        }
    }

    /// Obtain the credential handle for outbound transfer calls.
    pub async fn credentials(&self) -> Result<Credentials, ReplicationError> {
        match self {
            AuthResolver::StaticAccount(auth) => Ok(auth.credentials()),
            AuthResolver::AssumedRole(auth) => auth.credentials().await,
        }
    }
}
