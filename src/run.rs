use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Duration;
use glob::Pattern;
use tokio::process::Command;
use tracing::{info, warn};

use crate::aws::provider::{
    AwsSsoProvider, AwsStsProvider, MfaPrompt, PendingAuthorization, PrintAndWait, SsoProvider,
    StsProvider, TerminalPrompt,
};
use crate::aws::{Credentials, sso, static_key};
use crate::cache::AuthCache;
use crate::config::{ProfileChain, ProfileStore};

/// One resolved profile, ready to run the command under.
#[derive(Debug, Clone)]
pub struct CredSet {
    pub name: String,
    pub region: Option<String>,
    pub creds: Credentials,
}

pub struct RunConfig {
    pub pattern: Pattern,
    pub cache_path: PathBuf,
    pub load_cache: bool,
    pub save_cache: bool,
    pub refresh_padding: Duration,
    pub command: Vec<String>,
}

/// Resolve every matching profile, run the command once per profile, and
/// persist the cache only when the whole batch succeeded.
pub async fn execute(config: RunConfig) -> Result<()> {
    let store = ProfileStore::load()?;
    execute_with(
        config,
        &store,
        &AwsStsProvider,
        &AwsSsoProvider,
        &TerminalPrompt,
        &PrintAndWait,
    )
    .await
}

async fn execute_with(
    config: RunConfig,
    store: &ProfileStore,
    sts: &dyn StsProvider,
    sso_provider: &dyn SsoProvider,
    prompt: &dyn MfaPrompt,
    pending: &dyn PendingAuthorization,
) -> Result<()> {
    let mut cache = if config.load_cache {
        AuthCache::load(&config.cache_path).await
    } else {
        AuthCache::default()
    };

    let cred_sets = resolve_matching(
        store,
        &mut cache,
        sts,
        sso_provider,
        prompt,
        pending,
        &config.pattern,
        config.refresh_padding,
    )
    .await?;

    if cred_sets.is_empty() {
        warn!("No profiles matched {:?}", config.pattern.as_str());
    }

    run_commands(&cred_sets, &config.command).await?;

    // Only a fully successful batch may overwrite the snapshot; a partial
    // failure must not clobber a previously good on-disk cache.
    if config.save_cache {
        cache
            .save(&config.cache_path)
            .await
            .context("Failed to save credential cache")?;
    }
    Ok(())
}

struct SsoTarget {
    name: String,
    region: Option<String>,
    start_url: String,
    sso_region: String,
    account_id: String,
    role_name: String,
}

struct StaticTarget {
    name: String,
    region: Option<String>,
    access_key_id: String,
    secret_access_key: String,
    role_arn: Option<String>,
    mfa_serial: Option<String>,
}

/// Resolve credentials for every profile matching the glob: the SSO pass
/// over the config file first, then the static-key pass over the
/// credentials file. Any derivation failure aborts before a single command
/// has run.
async fn resolve_matching(
    store: &ProfileStore,
    cache: &mut AuthCache,
    sts: &dyn StsProvider,
    sso_provider: &dyn SsoProvider,
    prompt: &dyn MfaPrompt,
    pending: &dyn PendingAuthorization,
    pattern: &Pattern,
    padding: Duration,
) -> Result<Vec<CredSet>> {
    let mut sso_targets = Vec::new();
    store.each_sso_profile(|name, chain| {
        if !pattern.matches(name) {
            return Ok(());
        }
        // Sections without an SSO start URL are not device-flow profiles
        let Some(start_url) = chain.get_nonempty("sso_start_url") else {
            return Ok(());
        };
        sso_targets.push(SsoTarget {
            name: name.to_string(),
            region: chain.get_nonempty("region").map(str::to_string),
            start_url: start_url.to_string(),
            sso_region: require(chain, "sso_region", name)?.to_string(),
            account_id: require(chain, "sso_account_id", name)?.to_string(),
            role_name: require(chain, "sso_role_name", name)?.to_string(),
        });
        Ok(())
    })?;

    let mut static_targets = Vec::new();
    store.each_credential_profile(|name, chain| {
        if !pattern.matches(name) {
            return Ok(());
        }
        static_targets.push(StaticTarget {
            name: name.to_string(),
            region: chain.get_nonempty("region").map(str::to_string),
            access_key_id: require(chain, "aws_access_key_id", name)?.to_string(),
            secret_access_key: require(chain, "aws_secret_access_key", name)?.to_string(),
            role_arn: chain.get_nonempty("role_arn").map(str::to_string),
            mfa_serial: chain.get_nonempty("mfa_serial").map(str::to_string),
        });
        Ok(())
    })?;

    let mut cred_sets = Vec::new();

    for target in sso_targets {
        info!("[{}] Resolving SSO credentials", target.name);
        let creds = sso::resolve(
            cache,
            sso_provider,
            pending,
            &target.start_url,
            &target.sso_region,
            &target.account_id,
            &target.role_name,
            padding,
        )
        .await
        .with_context(|| format!("[{}] Failed to resolve SSO credentials", target.name))?;
        cred_sets.push(CredSet {
            name: target.name,
            region: target.region,
            creds,
        });
    }

    for target in static_targets {
        info!("[{}] Resolving credentials", target.name);
        let creds = static_key::resolve(
            cache,
            sts,
            prompt,
            &target.access_key_id,
            &target.secret_access_key,
            target.region.as_deref(),
            target.role_arn.as_deref(),
            target.mfa_serial.as_deref(),
            padding,
        )
        .await
        .with_context(|| format!("[{}] Failed to resolve credentials", target.name))?;
        cred_sets.push(CredSet {
            name: target.name,
            region: target.region,
            creds,
        });
    }

    Ok(cred_sets)
}

fn require<'a>(chain: &'a ProfileChain, key: &str, profile: &str) -> Result<&'a str> {
    chain
        .get_nonempty(key)
        .with_context(|| format!("[{profile}] missing required attribute '{key}'"))
}

/// Run the command once per credential set, in order, aborting the queue on
/// the first failure.
async fn run_commands(cred_sets: &[CredSet], command: &[String]) -> Result<()> {
    for set in cred_sets {
        info!("[{}] Running {:?}", set.name, command);
        run_command(command, set)
            .await
            .with_context(|| format!("[{}] Command failed", set.name))?;
    }
    Ok(())
}

/// The child environment is the current one with the credential variables
/// overridden, and the region overridden only when the profile defines one.
fn credential_env(set: &CredSet) -> Vec<(&'static str, String)> {
    let mut env = vec![
        ("AWS_ACCESS_KEY_ID", set.creds.access_key_id.clone()),
        ("AWS_SECRET_ACCESS_KEY", set.creds.secret_access_key.clone()),
        (
            "AWS_SESSION_TOKEN",
            set.creds.session_token.clone().unwrap_or_default(),
        ),
    ];
    if let Some(region) = &set.region {
        env.push(("AWS_DEFAULT_REGION", region.clone()));
    }
    env
}

async fn run_command(command: &[String], set: &CredSet) -> Result<()> {
    let (program, args) = command
        .split_first()
        .context("No command given")?;

    let status = Command::new(program)
        .args(args)
        .envs(credential_env(set))
        .status()
        .await
        .with_context(|| format!("Failed to execute {program:?}"))?;

    if !status.success() {
        bail!("{program:?} exited with {status}");
    }
    Ok(())
}
