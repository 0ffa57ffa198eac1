//! KV secret store access
//!
//! [`KvSecretStore`] is the seam the resolver reads through. [`VaultClient`]
//! implements it against the Vault HTTP API, handling both KV engine
//! versions.

use crate::core::interpolation::{interpolate, is_resolvable};
use crate::core::metadata::{ResourceReference, StepParameter};
use crate::core::value::{Mapping, Value};
use crate::secrets::{SecretError, SecretResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Environment variable carrying the Vault token
pub const VAULT_TOKEN_ENV: &str = "PIPER_vaultToken";

/// Field name to value of one KV secret
pub type SecretData = BTreeMap<String, String>;

/// A key-value secret engine indexed by path
#[async_trait]
pub trait KvSecretStore: Send + Sync {
    /// Fields stored at `path`; `None` when nothing is stored there
    async fn get_kv_secret(&self, path: &str) -> SecretResult<Option<SecretData>>;
}

/// Path templates tried when a reference declares none. `{name}` is the
/// secret name.
const DEFAULT_PATH_TEMPLATES: [&str; 3] = [
    "$(vaultPath)/{name}",
    "$(vaultBasePath)/$(vaultPipelineName)/{name}",
    "$(vaultBasePath)/GROUP-SECRETS/{name}",
];

/// Secret name of a KV reference: the configured override at the
/// reference's `name`, else its default
pub fn secret_name<'a>(reference: &'a ResourceReference, config: &'a Mapping) -> Option<&'a str> {
    config
        .get(&reference.name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or(reference.default.as_deref())
        .filter(|s| !s.is_empty())
}

/// Concrete KV paths to query for `reference`, in order. Templates that
/// reference an unset config value are left out.
pub fn secret_paths(reference: &ResourceReference, config: &Mapping) -> SecretResult<Vec<String>> {
    let templates: Vec<String> = if reference.paths.is_empty() {
        match secret_name(reference, config) {
            Some(name) => DEFAULT_PATH_TEMPLATES
                .iter()
                .map(|t| t.replace("{name}", name))
                .collect(),
            None => Vec::new(),
        }
    } else {
        reference.paths.clone()
    };

    let mut paths = Vec::new();
    for template in templates {
        if !is_resolvable(&template, config) {
            debug!("Skipping KV path '{}', not all references are set", template);
            continue;
        }
        let path = normalize_path(&interpolate(&reference.name, &template, config)?);
        if !path.is_empty() {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// The value stored for `param`, by its own name first, then its aliases
pub fn field_value<'a>(data: &'a SecretData, param: &StepParameter) -> Option<&'a str> {
    std::iter::once(param.name.as_str())
        .chain(param.aliases.iter().map(|a| a.name.as_str()))
        .find_map(|field| data.get(field).map(String::as_str).filter(|v| !v.is_empty()))
}

/// Join segments with `/`, dropping empty segments and surrounding whitespace
pub fn normalize_path(path: &str) -> String {
    path.trim()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Vault HTTP client for KV v1 and v2 engines
#[derive(Debug, Clone)]
pub struct VaultClient {
    client: reqwest::Client,
    address: String,
    token: String,
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VaultResponse {
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MountInfo {
    #[serde(default)]
    path: String,
    #[serde(default)]
    options: Option<MountOptions>,
}

#[derive(Debug, Deserialize)]
struct MountOptions {
    #[serde(default)]
    version: Option<String>,
}

impl VaultClient {
    pub fn new(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: address.into().trim_end_matches('/').to_string(),
            token: token.into(),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = (!namespace.is_empty()).then_some(namespace);
        self
    }

    /// Client for the server named by `vaultServerUrl`, if configured
    pub fn from_config(config: &Mapping, token: impl Into<String>) -> Option<Self> {
        let address = config
            .get("vaultServerUrl")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())?;
        let mut client = Self::new(address, token);
        if let Some(namespace) = config.get("vaultNamespace").and_then(Value::as_str) {
            client = client.with_namespace(namespace);
        }
        Some(client)
    }

    /// Raw `data` of the response at `path`; `None` on 404
    async fn read(&self, path: &str) -> SecretResult<Option<serde_json::Value>> {
        let url = format!("{}/v1/{}", self.address, normalize_path(path));
        let mut request = self.client.get(&url).header("X-Vault-Token", &self.token);
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await.map_err(|e| SecretError::Store {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SecretError::Store {
                path: path.to_string(),
                message: format!("HTTP {}: {}", status, text.trim()),
            });
        }

        let body: VaultResponse = response.json().await.map_err(|e| SecretError::Store {
            path: path.to_string(),
            message: format!("invalid response: {}", e),
        })?;
        Ok(body.data)
    }

    /// Mount point and KV engine version serving `path`
    async fn kv_info(&self, path: &str) -> SecretResult<(String, u32)> {
        let data = self
            .read(&format!("sys/internal/ui/mounts/{}", path))
            .await?
            .ok_or_else(|| SecretError::Store {
                path: path.to_string(),
                message: "failed to get version and engine mount point".to_string(),
            })?;
        let info: MountInfo = serde_json::from_value(data).map_err(|e| SecretError::Store {
            path: path.to_string(),
            message: format!("invalid mount info: {}", e),
        })?;

        let version = match info.options.and_then(|o| o.version) {
            Some(v) if !v.is_empty() => v.parse().map_err(|_| SecretError::Store {
                path: path.to_string(),
                message: format!("invalid KV engine version '{}'", v),
            })?,
            _ => 1,
        };
        Ok((info.path, version))
    }
}

/// API path of a KV v2 secret: `<mount>/data/<rest>`
fn versioned_path(path: &str, mount: &str) -> String {
    let mount = normalize_path(mount);
    let rest = path.strip_prefix(mount.as_str()).unwrap_or(path);
    normalize_path(&format!("{}/data/{}", mount, rest))
}

/// Render secret fields as strings; nested values become JSON
fn secret_data(path: &str, raw: serde_json::Value) -> SecretResult<SecretData> {
    let serde_json::Value::Object(fields) = raw else {
        return Err(SecretError::Store {
            path: path.to_string(),
            message: "expected 'data' to be an object".to_string(),
        });
    };
    let mut data = SecretData::new();
    for (key, value) in fields {
        let rendered = match value {
            serde_json::Value::String(s) => s,
            other => match serde_json::to_string(&other) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to render secret field '{}': {}", key, e);
                    continue;
                }
            },
        };
        data.insert(key, rendered);
    }
    Ok(data)
}

#[async_trait]
impl KvSecretStore for VaultClient {
    async fn get_kv_secret(&self, path: &str) -> SecretResult<Option<SecretData>> {
        let path = normalize_path(path);
        let (mount, version) = self.kv_info(&path).await?;
        let api_path = match version {
            1 => path.clone(),
            2 => versioned_path(&path, &mount),
            other => {
                return Err(SecretError::Store {
                    path,
                    message: format!("KV engine version {} is not supported", other),
                })
            }
        };

        let Some(data) = self.read(&api_path).await? else {
            return Ok(None);
        };
        let raw = if version == 2 {
            match data {
                serde_json::Value::Object(mut outer) => {
                    outer.remove("data").ok_or_else(|| SecretError::Store {
                        path: path.clone(),
                        message: "missing 'data' field in response".to_string(),
                    })?
                }
                _ => {
                    return Err(SecretError::Store {
                        path,
                        message: "expected 'data' to be an object".to_string(),
                    })
                }
            }
        } else {
            data
        };
        // deleted v2 versions come back with null data
        if raw.is_null() {
            return Ok(None);
        }
        secret_data(&path, raw).map(Some)
    }
}
