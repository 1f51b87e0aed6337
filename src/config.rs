use std::path::Path;

use anyhow::{Context, Result, bail};
use ini::{Ini, Properties};
use tracing::debug;

use crate::constants;

/// Prefix of SSO-capable profile sections in the AWS config file
const PROFILE_SECTION_PREFIX: &str = "profile ";

/// The attribute set of a profile and every `source_profile` it chains to,
/// ordered innermost (root source) first, target profile last.
#[derive(Debug, Clone)]
pub struct ProfileChain {
    sections: Vec<Properties>,
}

impl ProfileChain {
    /// Look up an attribute across the chain; the last (most specific)
    /// definition wins. Implemented as an explicit fold over the ordered
    /// sections so the override order never depends on map iteration.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .fold(None, |found, section| section.get(key).or(found))
    }

    /// Like `get`, but treats an empty value as unset.
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|value| !value.is_empty())
    }
}

/// The user's AWS profile configuration: `~/.aws/config` for SSO profiles
/// and `~/.aws/credentials` for static-key profiles. Either file may be
/// absent, in which case the corresponding pass yields no profiles.
pub struct ProfileStore {
    config: Option<Ini>,
    credentials: Option<Ini>,
}

impl ProfileStore {
    /// Load from the default locations (honoring the standard env overrides).
    pub fn load() -> Result<Self> {
        let config = load_optional(constants::aws_config_path().as_deref())?;
        let credentials = load_optional(constants::aws_credentials_path().as_deref())?;
        Ok(Self {
            config,
            credentials,
        })
    }

    pub fn from_ini(config: Option<Ini>, credentials: Option<Ini>) -> Self {
        Self {
            config,
            credentials,
        }
    }

    /// Iterate SSO-capable profiles (`[profile <name>]` sections of the
    /// config file) in file order, supplying each profile's attribute chain.
    /// Stops on the first error returned by `f`.
    pub fn each_sso_profile(
        &self,
        mut f: impl FnMut(&str, &ProfileChain) -> Result<()>,
    ) -> Result<()> {
        let Some(ini) = &self.config else {
            return Ok(());
        };
        for (section_name, _) in ini.iter() {
            let Some(section_name) = section_name else {
                continue;
            };
            let Some(name) = section_name.strip_prefix(PROFILE_SECTION_PREFIX) else {
                continue;
            };
            let chain = build_chain(ini, section_name, true)
                .with_context(|| format!("Invalid profile chain for '{}'", name.trim()))?;
            f(name.trim(), &chain)?;
        }
        Ok(())
    }

    /// Iterate static-key profiles (sections of the credentials file) in
    /// file order, supplying each profile's attribute chain. Stops on the
    /// first error returned by `f`.
    pub fn each_credential_profile(
        &self,
        mut f: impl FnMut(&str, &ProfileChain) -> Result<()>,
    ) -> Result<()> {
        let Some(ini) = &self.credentials else {
            return Ok(());
        };
        for (section_name, _) in ini.iter() {
            let Some(section_name) = section_name else {
                continue;
            };
            let chain = build_chain(ini, section_name, false)
                .with_context(|| format!("Invalid profile chain for '{section_name}'"))?;
            f(section_name, &chain)?;
        }
        Ok(())
    }
}

fn load_optional(path: Option<&Path>) -> Result<Option<Ini>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.exists() {
        debug!("No profile file at {}", path.display());
        return Ok(None);
    }
    let ini = Ini::load_from_file(path)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(ini))
}

/// Walk `source_profile` references from the target section, prepending each
/// source so the innermost profile ends up first. Cycles are an error.
fn build_chain(ini: &Ini, section_name: &str, in_config_file: bool) -> Result<ProfileChain> {
    let mut current = ini
        .section(Some(section_name))
        .with_context(|| format!("Section '{section_name}' not found"))?;
    let mut sections = vec![current.clone()];
    let mut visited = vec![section_name.to_string()];

    while let Some(source) = current.get("source_profile") {
        let resolved = resolve_section_name(ini, source, in_config_file)
            .with_context(|| format!("source_profile '{source}' not found"))?;
        if visited.iter().any(|seen| seen == &resolved) {
            bail!("source_profile cycle through '{source}'");
        }
        current = ini
            .section(Some(resolved.as_str()))
            .with_context(|| format!("source_profile '{source}' not found"))?;
        sections.insert(0, current.clone());
        visited.push(resolved);
    }

    Ok(ProfileChain { sections })
}

/// In the config file a `source_profile` value names a `[profile <name>]`
/// section; in the credentials file it names the section directly.
fn resolve_section_name(ini: &Ini, source: &str, in_config_file: bool) -> Result<String> {
    if in_config_file {
        let prefixed = format!("{PROFILE_SECTION_PREFIX}{source}");
        if ini.section(Some(prefixed.as_str())).is_some() {
            return Ok(prefixed);
        }
    }
    if ini.section(Some(source)).is_some() {
        return Ok(source.to_string());
    }
    bail!("no such section");
}
