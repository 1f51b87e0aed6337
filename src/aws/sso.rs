use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use tracing::debug;

use crate::aws::Credentials;
use crate::aws::provider::{PendingAuthorization, SsoProvider, TokenPollError};
use crate::cache::{AuthCache, BearerToken, ClientRegistration, DeviceAuthorization};

/// Cache key for a resolved SSO credential set.
pub fn triple_key(start_url: &str, account_id: &str, role_name: &str) -> String {
    format!("SSO:{start_url}:{account_id}:{role_name}")
}

/// Resolve credentials for an SSO profile via the device-authorization grant.
///
/// Registration is cached per region, the device authorization and bearer
/// token per start URL, the final credentials per
/// `(start URL, account, role)` triple. Profiles sharing a start URL and
/// region therefore reuse the interactive approval and only pay one
/// role-credential exchange each.
pub async fn resolve(
    cache: &mut AuthCache,
    sso: &dyn SsoProvider,
    pending: &dyn PendingAuthorization,
    start_url: &str,
    region: &str,
    account_id: &str,
    role_name: &str,
    padding: Duration,
) -> Result<Credentials> {
    let key = triple_key(start_url, account_id, role_name);
    if let Some(cached) = cache.fresh_credentials(&key, Utc::now(), padding) {
        debug!("Returning cached SSO credentials for {:?}", key);
        return Ok(cached.clone());
    }

    let token = ensure_token(cache, sso, pending, start_url, region).await?;

    let mut creds = sso
        .role_credentials(region, &token, account_id, role_name)
        .await
        .with_context(|| format!("Role credential exchange failed for {account_id}/{role_name}"))?;
    creds.source = key.clone();
    cache.put_credentials(key, creds.clone());
    Ok(creds)
}

async fn ensure_registration(
    cache: &mut AuthCache,
    sso: &dyn SsoProvider,
    region: &str,
) -> Result<ClientRegistration> {
    if let Some(registration) = cache.sso_registrations.get(region) {
        return Ok(registration.clone());
    }
    let registration = sso
        .register_client(region)
        .await
        .with_context(|| format!("Client registration failed in {region}"))?;
    cache
        .sso_registrations
        .insert(region.to_string(), registration.clone());
    Ok(registration)
}

async fn ensure_authorization(
    cache: &mut AuthCache,
    sso: &dyn SsoProvider,
    start_url: &str,
    region: &str,
) -> Result<DeviceAuthorization> {
    if let Some(authorization) = cache.sso_authorizations.get(start_url) {
        return Ok(authorization.clone());
    }
    let registration = ensure_registration(cache, sso, region).await?;
    let authorization = sso
        .start_device_authorization(region, &registration, start_url)
        .await
        .with_context(|| format!("Device authorization failed for {start_url}"))?;
    cache
        .sso_authorizations
        .insert(start_url.to_string(), authorization.clone());
    Ok(authorization)
}

/// Obtain a bearer token for `start_url`, polling the token endpoint while
/// the operator approves the device authorization in a browser.
///
/// An expired authorization is dropped from the cache so the next run
/// starts a fresh one instead of polling a dead device code.
async fn ensure_token(
    cache: &mut AuthCache,
    sso: &dyn SsoProvider,
    pending: &dyn PendingAuthorization,
    start_url: &str,
    region: &str,
) -> Result<BearerToken> {
    loop {
        if let Some(token) = cache.sso_tokens.get(start_url) {
            return Ok(token.clone());
        }
        let registration = ensure_registration(cache, sso, region).await?;
        let authorization = ensure_authorization(cache, sso, start_url, region).await?;

        match sso.create_token(region, &registration, &authorization).await {
            Ok(token) => {
                cache
                    .sso_tokens
                    .insert(start_url.to_string(), token.clone());
                return Ok(token);
            }
            Err(TokenPollError::Pending) => {
                pending
                    .on_pending(&authorization.verification_uri_complete)
                    .await?;
            }
            Err(TokenPollError::Expired) => {
                cache.sso_authorizations.remove(start_url);
                bail!(
                    "device authorization for {start_url} expired before it was approved; \
                     re-run to start a new one"
                );
            }
            Err(TokenPollError::Fatal(e)) => {
                return Err(e.context("Token request failed"));
            }
        }
    }
}
