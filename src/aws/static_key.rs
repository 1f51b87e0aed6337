use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tracing::debug;

use crate::aws::Credentials;
use crate::aws::provider::{MfaPrompt, StsProvider};
use crate::cache::AuthCache;

/// Resolve credentials for a static-key profile, elevating through MFA
/// and/or role assumption when the profile asks for them.
///
/// The seed key pair itself is never cached: it cannot expire and
/// re-deriving it costs nothing. Failed exchanges propagate without
/// touching whatever the cache already holds for that key.
pub async fn resolve(
    cache: &mut AuthCache,
    sts: &dyn StsProvider,
    prompt: &dyn MfaPrompt,
    access_key_id: &str,
    secret_access_key: &str,
    region: Option<&str>,
    role_arn: Option<&str>,
    mfa_serial: Option<&str>,
    padding: Duration,
) -> Result<Credentials> {
    let mut active = Credentials::from_keys(access_key_id, secret_access_key);

    if let Some(serial) = mfa_serial {
        active = match cache.fresh_credentials(serial, Utc::now(), padding) {
            Some(cached) => {
                debug!("Returning cached MFA credentials for {:?}", serial);
                cached.clone()
            }
            None => {
                debug!("No valid cached MFA credentials for {:?}, refreshing", serial);
                let token_code = prompt.read_token(serial)?;
                let mut creds = sts
                    .get_session_token(&active, region, serial, &token_code)
                    .await
                    .with_context(|| format!("MFA session exchange failed for {serial}"))?;
                creds.source = format!("MFA:{serial}");
                cache.put_credentials(serial, creds.clone());
                creds
            }
        };
    }

    if let Some(role) = role_arn {
        active = match cache.fresh_credentials(role, Utc::now(), padding) {
            Some(cached) => {
                debug!("Returning cached role credentials for {:?}", role);
                cached.clone()
            }
            None => {
                debug!("No valid cached role credentials for {:?}, refreshing", role);
                let mut creds = sts
                    .assume_role(&active, region, role)
                    .await
                    .with_context(|| format!("Role assumption failed for {role}"))?;
                creds.source = format!("SESS:{role}");
                cache.put_credentials(role, creds.clone());
                creds
            }
        };
    }

    Ok(active)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::aws::provider::fakes::{FakePrompt, FakeSts};

    fn padding() -> Duration {
        Duration::minutes(5)
    }

    #[tokio::test]
    async fn test_plain_profile_returns_seed_unchanged_and_uncached() {
        let mut cache = AuthCache::default();
        let sts = FakeSts::default();
        let prompt = FakePrompt::answering("000000");

        let creds = resolve(
            &mut cache,
            &sts,
            &prompt,
            "AKIAEXAMPLE",
            "secret",
            None,
            None,
            None,
            padding(),
        )
        .await
        .unwrap();

        assert_eq!(creds.access_key_id, "AKIAEXAMPLE");
        assert!(!creds.can_expire);
        assert!(cache.credentials.is_empty());
        assert_eq!(sts.session_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sts.assume_calls.load(Ordering::SeqCst), 0);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mfa_elevation_prompts_exchanges_and_caches() {
        let mut cache = AuthCache::default();
        let sts = FakeSts::default();
        let prompt = FakePrompt::answering("123456");

        let creds = resolve(
            &mut cache,
            &sts,
            &prompt,
            "AKIAEXAMPLE",
            "secret",
            Some("us-west-2"),
            None,
            Some("X"),
            padding(),
        )
        .await
        .unwrap();

        assert_eq!(creds.access_key_id, "SESSION-X");
        assert_eq!(creds.source, "MFA:X");
        assert!(creds.can_expire);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sts.session_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*sts.session_codes.lock().unwrap(), vec!["123456"]);

        let cached = cache
            .fresh_credentials("X", Utc::now(), padding())
            .expect("MFA credentials cached under the serial");
        assert_eq!(cached.source, "MFA:X");
    }

    #[tokio::test]
    async fn test_fresh_cache_hit_performs_no_provider_calls() {
        let mut cache = AuthCache::default();
        let sts = FakeSts::default();
        let prompt = FakePrompt::answering("123456");

        resolve(
            &mut cache,
            &sts,
            &prompt,
            "AKIAEXAMPLE",
            "secret",
            None,
            Some("arn:aws:iam::111122223333:role/Admin"),
            Some("X"),
            padding(),
        )
        .await
        .unwrap();

        // Second resolution within the fresh window: everything from cache.
        let creds = resolve(
            &mut cache,
            &sts,
            &prompt,
            "AKIAEXAMPLE",
            "secret",
            None,
            Some("arn:aws:iam::111122223333:role/Admin"),
            Some("X"),
            padding(),
        )
        .await
        .unwrap();

        assert_eq!(creds.source, "SESS:arn:aws:iam::111122223333:role/Admin");
        assert_eq!(sts.session_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sts.assume_calls.load(Ordering::SeqCst), 1);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_role_assumption_uses_mfa_session_credentials() {
        let mut cache = AuthCache::default();
        let sts = FakeSts::default();
        let prompt = FakePrompt::answering("123456");

        let creds = resolve(
            &mut cache,
            &sts,
            &prompt,
            "AKIAEXAMPLE",
            "secret",
            None,
            Some("arn:aws:iam::111122223333:role/Admin"),
            Some("X"),
            padding(),
        )
        .await
        .unwrap();

        assert_eq!(creds.access_key_id, "ROLE-arn:aws:iam::111122223333:role/Admin");
        // The role assumption must have been seeded with the MFA session,
        // not the long-lived key pair.
        assert_eq!(*sts.assume_seeds.lock().unwrap(), vec!["SESSION-X"]);
        assert!(
            cache
                .fresh_credentials("arn:aws:iam::111122223333:role/Admin", Utc::now(), padding())
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_failed_mfa_exchange_leaves_cache_untouched() {
        let now = Utc::now();
        let stale = Credentials {
            access_key_id: "STALE".to_string(),
            secret_access_key: "stale-secret".to_string(),
            session_token: Some("stale-token".to_string()),
            expiration: Some(now - Duration::hours(1)),
            can_expire: true,
            source: "MFA:X".to_string(),
        };
        let mut cache = AuthCache::default();
        cache.put_credentials("X", stale.clone());

        let sts = FakeSts {
            fail_session: true,
            ..FakeSts::default()
        };
        let prompt = FakePrompt::answering("999999");

        let result = resolve(
            &mut cache,
            &sts,
            &prompt,
            "AKIAEXAMPLE",
            "secret",
            None,
            None,
            Some("X"),
            padding(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(cache.credentials.get("X"), Some(&stale));
    }

    #[tokio::test]
    async fn test_stale_cached_entry_triggers_refresh() {
        let now = Utc::now();
        let mut cache = AuthCache::default();
        cache.put_credentials(
            "X",
            Credentials {
                access_key_id: "STALE".to_string(),
                secret_access_key: "stale-secret".to_string(),
                session_token: None,
                // Expires inside the padding window, so it counts as absent
                expiration: Some(now + Duration::minutes(2)),
                can_expire: true,
                source: "MFA:X".to_string(),
            },
        );

        let sts = FakeSts::default();
        let prompt = FakePrompt::answering("123456");

        let creds = resolve(
            &mut cache,
            &sts,
            &prompt,
            "AKIAEXAMPLE",
            "secret",
            None,
            None,
            Some("X"),
            padding(),
        )
        .await
        .unwrap();

        assert_eq!(creds.access_key_id, "SESSION-X");
        assert_eq!(sts.session_calls.load(Ordering::SeqCst), 1);
    }
}
