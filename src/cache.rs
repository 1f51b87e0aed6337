use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::aws::Credentials;

/// OAuth client registration, cached per region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    pub secret_expires_at: Option<DateTime<Utc>>,
}

/// A pending or granted device authorization, cached per SSO start URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i32,
    pub interval: i32,
}

/// Bearer token for SSO role-credential exchanges, cached per start URL and
/// shared across every account/role pair under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BearerToken {
    pub access_token: String,
    pub expires_in: i32,
}

/// Process-wide derivation cache.
///
/// Four independent string-keyed maps persisted together as one JSON
/// snapshot. Credential entries are checked for freshness on lookup; the
/// SSO registration, authorization, and token maps are presence-based —
/// absence means "never derived" and triggers a fresh derivation.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthCache {
    /// MFA serials, role ARNs, or SSO triple keys to credentials
    #[serde(default)]
    pub credentials: HashMap<String, Credentials>,

    /// Regions to OAuth client registrations
    #[serde(default)]
    pub sso_registrations: HashMap<String, ClientRegistration>,
    /// Start URLs to device authorizations
    #[serde(default)]
    pub sso_authorizations: HashMap<String, DeviceAuthorization>,
    /// Start URLs to bearer tokens
    #[serde(default)]
    pub sso_tokens: HashMap<String, BearerToken>,
}

impl AuthCache {
    /// Look up cached credentials, returning them only if still fresh at
    /// `now` with the given refresh padding.
    pub fn fresh_credentials(
        &self,
        key: &str,
        now: DateTime<Utc>,
        padding: Duration,
    ) -> Option<&Credentials> {
        self.credentials
            .get(key)
            .filter(|creds| creds.is_fresh(now, padding))
    }

    /// Unconditionally overwrite the cached credentials for `key`.
    pub fn put_credentials(&mut self, key: impl Into<String>, creds: Credentials) {
        self.credentials.insert(key.into(), creds);
    }

    /// Load a cache snapshot from `path`.
    ///
    /// A missing or unparseable snapshot yields an empty cache rather than
    /// an error; the cache is purely an optimization.
    pub async fn load(path: &Path) -> Self {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("No credential cache at {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(cache) => {
                debug!("Loaded credential cache from {}", path.display());
                cache
            }
            Err(e) => {
                debug!(
                    "Ignoring unreadable credential cache at {}: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Persist the full cache state to `path`, creating parent directories
    /// as needed. The file holds live secrets and is restricted to the
    /// owner on unix.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let json = serde_json::to_vec(self).context("Failed to serialize credential cache")?;
        fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write credential cache to {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            fs::set_permissions(path, permissions).await?;
        }

        debug!("Saved credential cache to {}", path.display());
        Ok(())
    }
}
