//! Credential bundles exported as environment variables
//!
//! A bundle is a KV secret whose listed keys become `<prefix><KEY>` exports.
//!
//! ```yaml
//! vaultCredentialPath: [appCredentials1, appCredentials2]
//! vaultCredentialKeys: [[appUser1, appUserPw1], [appUser2, appUserPw2]]
//! vaultCredentialEnvPrefix: MY_
//! ```
//!
//! Exports are handed back to the caller; the process environment is left
//! as it is.

use crate::core::value::{Mapping, Value};
use crate::secrets::kv::{normalize_path, KvSecretStore};
use crate::secrets::SecretResult;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Prefix every general purpose credential is exported under
pub const VAULT_CREDENTIAL_ENV_PREFIX: &str = "PIPER_VAULTCREDENTIAL_";

/// Prefix of test credentials when none is configured
pub const TEST_CREDENTIAL_ENV_PREFIX: &str = "PIPER_TESTCREDENTIAL_";

/// Config keys and prefixes of one credential family
#[derive(Debug, Clone, Copy)]
pub struct CredentialFamily {
    pub path_key: &'static str,
    pub keys_key: &'static str,
    pub prefix_key: &'static str,

    /// Used when `prefix_key` is unset
    pub default_prefix: Option<&'static str>,

    /// Always exported in addition to the configured prefix
    pub fixed_prefix: Option<&'static str>,
}

pub const VAULT_CREDENTIALS: CredentialFamily = CredentialFamily {
    path_key: "vaultCredentialPath",
    keys_key: "vaultCredentialKeys",
    prefix_key: "vaultCredentialEnvPrefix",
    default_prefix: None,
    fixed_prefix: Some(VAULT_CREDENTIAL_ENV_PREFIX),
};

pub const TEST_CREDENTIALS: CredentialFamily = CredentialFamily {
    path_key: "vaultTestCredentialPath",
    keys_key: "vaultTestCredentialKeys",
    prefix_key: "vaultTestCredentialEnvPrefix",
    default_prefix: Some(TEST_CREDENTIAL_ENV_PREFIX),
    fixed_prefix: None,
};

/// One environment variable to export
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialExport {
    pub name: String,
    pub value: String,
}

impl std::fmt::Debug for CredentialExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialExport")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

static NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^A-Za-z0-9]+").expect("pattern compiles"));

/// Environment variable form of a key: uppercase, every run of other
/// characters collapsed to `_`, no leading or trailing `_`
pub fn convert_env_var(key: &str) -> String {
    NON_ALPHANUMERIC
        .replace_all(key, "_")
        .trim_matches('_')
        .to_uppercase()
}

/// String or list of strings
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items.iter().filter_map(Value::to_scalar_string).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => other.to_scalar_string().into_iter().collect(),
    }
}

/// Keys to export for the bundle at `index`. A flat list applies to every
/// bundle; a list of lists pairs up with the bundles by position.
fn keys_for(value: Option<&Value>, index: usize) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) if items.iter().any(|i| matches!(i, Value::Sequence(_))) => {
            string_list(items.get(index))
        }
        other => string_list(other),
    }
}

/// Prefixes for the bundle at `index`. A list pairs up by position, a single
/// string applies to every bundle.
fn prefixes_for(family: &CredentialFamily, config: &Mapping, index: usize) -> Vec<String> {
    let configured = match config.get(family.prefix_key) {
        None | Some(Value::Null) => family.default_prefix.map(str::to_string),
        Some(Value::Sequence(items)) => items.get(index).and_then(Value::to_scalar_string),
        Some(other) => other.to_scalar_string(),
    };
    let mut prefixes: Vec<String> = configured.into_iter().collect();
    if let Some(fixed) = family.fixed_prefix {
        if !prefixes.iter().any(|p| p == fixed) {
            prefixes.push(fixed.to_string());
        }
    }
    prefixes
}

/// Where a bundle may live: under `vaultPath`, then the pipeline and group
/// folders below `vaultBasePath`
fn bundle_locations(config: &Mapping, bundle: &str) -> Vec<String> {
    let setting = |key: &str| {
        config
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    };
    let mut locations = Vec::new();
    if let Some(path) = setting("vaultPath") {
        locations.push(normalize_path(&format!("{}/{}", path, bundle)));
    }
    if let Some(base) = setting("vaultBasePath") {
        if let Some(pipeline) = setting("vaultPipelineName") {
            locations.push(normalize_path(&format!("{}/{}/{}", base, pipeline, bundle)));
        }
        locations.push(normalize_path(&format!("{}/GROUP-SECRETS/{}", base, bundle)));
    }
    locations
}

/// Read the bundles of `family` and build their exports
pub async fn resolve(
    store: &dyn KvSecretStore,
    config: &Mapping,
    family: &CredentialFamily,
) -> SecretResult<Vec<CredentialExport>> {
    let bundles = string_list(config.get(family.path_key));
    let mut exports = Vec::new();

    for (index, bundle) in bundles.iter().enumerate() {
        let keys = keys_for(config.get(family.keys_key), index);
        if keys.is_empty() {
            warn!("No keys configured for credential bundle '{}'", bundle);
            continue;
        }

        let mut data = None;
        for location in bundle_locations(config, bundle) {
            if let Some(found) = store.get_kv_secret(&location).await? {
                debug!("Found credential bundle '{}' at '{}'", bundle, location);
                data = Some(found);
                break;
            }
        }
        let Some(data) = data else {
            warn!("Credential bundle '{}' was not found", bundle);
            continue;
        };

        let prefixes = prefixes_for(family, config, index);
        for key in &keys {
            let Some(value) = data.get(key) else {
                debug!("Credential bundle '{}' has no key '{}'", bundle, key);
                continue;
            };
            let variable = convert_env_var(key);
            for prefix in &prefixes {
                exports.push(CredentialExport {
                    name: format!("{}{}", prefix, variable),
                    value: value.clone(),
                });
            }
        }
    }
    Ok(exports)
}
