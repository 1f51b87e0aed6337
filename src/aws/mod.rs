use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod provider;
pub mod sso;
pub mod static_key;

/// A resolved set of AWS credentials together with its provenance.
///
/// `source` is a human-readable tag (`"MFA:<serial>"`, `"SESS:<roleArn>"`,
/// `"SSO:<start>:<account>:<role>"`) used for cache keying and diagnostics;
/// it is never parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub can_expire: bool,
    pub source: String,
}

impl Credentials {
    /// Seed credentials from a long-lived key pair; these never expire and
    /// are never cached.
    pub fn from_keys(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expiration: None,
            can_expire: false,
            source: String::new(),
        }
    }

    /// Whether these credentials are still usable at `now`.
    ///
    /// A record expiring within `padding` of `now` counts as stale, so it is
    /// refreshed before a command can outlive it. Every cache lookup goes
    /// through this one predicate.
    pub fn is_fresh(&self, now: DateTime<Utc>, padding: Duration) -> bool {
        if !self.can_expire {
            return true;
        }
        match self.expiration {
            Some(expiration) => expiration > now + padding,
            None => false,
        }
    }
}
