//! Secret resolution
//!
//! Fills empty secret parameters of a resolved [`StepConfig`] from a KV
//! secret store and from a token-issuing trust service. A parameter that
//! already holds a non-empty string is never touched.
//!
//! Parameters referencing a `vaultSecretFile` receive the path of a
//! temporary file holding the secret instead of the secret itself. The files
//! live in one directory per resolver, removed by
//! [`SecretResolver::remove_secret_files`] or when the resolver is dropped.

pub mod credentials;
pub mod kv;
pub mod trust;

pub use credentials::{convert_env_var, CredentialExport, CredentialFamily};
pub use kv::{KvSecretStore, SecretData, VaultClient};
pub use trust::{TokenIssuer, TrustClient, TrustConfig};

use crate::core::config::StepConfig;
use crate::core::context::SecretSink;
use crate::core::error::ConfigError;
use crate::core::metadata::{
    ResourceReference, StepParameter, TRUST_ENGINE_SECRET_REF, VAULT_SECRET_FILE_REF, VAULT_SECRET_REF,
};
use crate::core::value::Mapping;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised by the secret providers
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Failed to read secret at '{path}': {message}")]
    Store { path: String, message: String },

    #[error("Request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("Secret resolution was cancelled")]
    Cancelled,

    #[error("Failed to write secret file for '{parameter}': {source}")]
    File {
        parameter: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to build secret path: {0}")]
    Interpolation(#[from] ConfigError),
}

/// Result type for secret operations
pub type SecretResult<T> = Result<T, SecretError>;

/// Where an adopted secret came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    Kv { path: String },
    /// Written to `file`, whose path became the parameter value
    KvFile { path: String, file: PathBuf },
    TrustEngine { system: String },
}

/// A parameter filled by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    pub parameter: String,
    pub source: SecretSource,
}

/// Fills secret parameters from the configured providers
pub struct SecretResolver {
    kv_store: Option<Arc<dyn KvSecretStore>>,
    token_issuer: Option<Arc<dyn TokenIssuer>>,
    secrets: Arc<dyn SecretSink>,
    cancel: CancellationToken,
    secret_files: Mutex<Option<TempDir>>,
}

impl SecretResolver {
    /// Resolver without providers; adopted values are registered with `secrets`
    pub fn new(secrets: Arc<dyn SecretSink>) -> Self {
        Self {
            kv_store: None,
            token_issuer: None,
            secrets,
            cancel: CancellationToken::new(),
            secret_files: Mutex::new(None),
        }
    }

    pub fn with_kv_store(mut self, store: Arc<dyn KvSecretStore>) -> Self {
        self.kv_store = Some(store);
        self
    }

    pub fn with_token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.token_issuer = Some(issuer);
        self
    }

    /// Stop at the next provider call once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fill every empty parameter that carries a supported resource
    /// reference. The KV store is asked first for all parameters, the trust
    /// service afterwards for those still empty.
    ///
    /// On error or cancellation the values adopted so far stay in place.
    pub async fn resolve(
        &self,
        step_config: &mut StepConfig,
        parameters: &[StepParameter],
    ) -> SecretResult<Vec<ResolvedSecret>> {
        let mut resolved = Vec::new();

        if let Some(store) = &self.kv_store {
            for param in parameters {
                let Some((reference, as_file)) = kv_reference(param) else {
                    continue;
                };
                if has_value(&step_config.config, &param.name) {
                    debug!("Parameter '{}' is already set, skipping KV lookup", param.name);
                    continue;
                }
                let paths = kv::secret_paths(reference, &step_config.config)?;
                for path in paths {
                    let data = self.cancellable(store.get_kv_secret(&path)).await?;
                    let Some(data) = data else {
                        debug!("No secret found at '{}'", path);
                        continue;
                    };
                    let Some(value) = kv::field_value(&data, param) else {
                        continue;
                    };
                    let source = if as_file {
                        let file = self.write_secret_file(&param.name, value)?;
                        info!(
                            "Resolved parameter '{}' from KV path '{}' into a secret file",
                            param.name, path
                        );
                        self.secrets.register(value);
                        step_config.set(&param.name, file.to_string_lossy().into_owned());
                        SecretSource::KvFile { path, file }
                    } else {
                        info!("Resolved parameter '{}' from KV path '{}'", param.name, path);
                        self.adopt(step_config, &param.name, value);
                        SecretSource::Kv { path }
                    };
                    resolved.push(ResolvedSecret {
                        parameter: param.name.clone(),
                        source,
                    });
                    break;
                }
            }
        }

        if let Some(issuer) = &self.token_issuer {
            for param in parameters {
                let Some(reference) = param.reference(TRUST_ENGINE_SECRET_REF) else {
                    continue;
                };
                if has_value(&step_config.config, &param.name) {
                    continue;
                }
                let Some(system) = reference.default.as_deref().filter(|s| !s.is_empty()) else {
                    debug!("Parameter '{}' names no trust engine system", param.name);
                    continue;
                };
                let systems = [system.to_string()];
                let tokens = match self.cancellable(issuer.issue_tokens(&systems)).await {
                    Ok(tokens) => tokens,
                    Err(SecretError::Cancelled) => return Err(SecretError::Cancelled),
                    Err(e) => {
                        warn!(
                            "Could not retrieve '{}' from the trust engine, parameter '{}' stays empty: {}",
                            system, param.name, e
                        );
                        continue;
                    }
                };
                match tokens.get(system).filter(|token| !token.is_empty()) {
                    Some(token) => {
                        info!("Resolved parameter '{}' from the trust engine", param.name);
                        self.adopt(step_config, &param.name, token);
                        resolved.push(ResolvedSecret {
                            parameter: param.name.clone(),
                            source: SecretSource::TrustEngine {
                                system: system.to_string(),
                            },
                        });
                    }
                    None => debug!("Trust engine returned no token for '{}'", system),
                }
            }
        }

        Ok(resolved)
    }

    /// Read both credential families from the KV store. Returns nothing when
    /// no store is configured.
    pub async fn credential_exports(&self, config: &Mapping) -> SecretResult<Vec<CredentialExport>> {
        let Some(store) = &self.kv_store else {
            return Ok(Vec::new());
        };
        let mut exports = Vec::new();
        for family in [&credentials::VAULT_CREDENTIALS, &credentials::TEST_CREDENTIALS] {
            let found = self
                .cancellable(credentials::resolve(store.as_ref(), config, family))
                .await?;
            for export in &found {
                self.secrets.register(&export.value);
            }
            exports.extend(found);
        }
        Ok(exports)
    }

    /// Directory holding the secret files written so far
    pub fn secret_file_dir(&self) -> Option<PathBuf> {
        self.lock_secret_files()
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    /// Delete every secret file written by this resolver
    pub fn remove_secret_files(&self) -> io::Result<()> {
        match self.lock_secret_files().take() {
            Some(dir) => {
                debug!("Removing secret files in {}", dir.path().display());
                dir.close()
            }
            None => Ok(()),
        }
    }

    /// Detach the secret files from this resolver so they outlive it.
    /// Returns the directory the caller is now responsible for.
    pub fn persist_secret_files(&self) -> Option<PathBuf> {
        self.lock_secret_files().take().map(TempDir::keep)
    }

    fn write_secret_file(&self, parameter: &str, value: &str) -> SecretResult<PathBuf> {
        let file_error = |source| SecretError::File {
            parameter: parameter.to_string(),
            source,
        };
        let mut slot = self.lock_secret_files();
        let dir = match slot.take() {
            Some(dir) => dir,
            None => tempfile::Builder::new()
                .prefix("stepconf-secrets-")
                .tempdir()
                .map_err(file_error)?,
        };
        let dir = slot.insert(dir);

        let mut file = tempfile::Builder::new()
            .prefix(parameter)
            .tempfile_in(dir.path())
            .map_err(file_error)?;
        file.write_all(value.as_bytes()).map_err(file_error)?;
        file.flush().map_err(file_error)?;
        // removed together with the directory
        file.into_temp_path().keep().map_err(|e| file_error(e.error))
    }

    fn lock_secret_files(&self) -> MutexGuard<'_, Option<TempDir>> {
        self.secret_files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn adopt(&self, step_config: &mut StepConfig, name: &str, value: &str) {
        self.secrets.register(value);
        step_config.set(name, value);
    }

    async fn cancellable<T, F>(&self, call: F) -> SecretResult<T>
    where
        F: Future<Output = SecretResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(SecretError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SecretError::Cancelled),
            result = call => result,
        }
    }
}

/// The KV reference of `param` and whether it resolves into a file
fn kv_reference(param: &StepParameter) -> Option<(&ResourceReference, bool)> {
    param
        .reference(VAULT_SECRET_REF)
        .map(|reference| (reference, false))
        .or_else(|| param.reference(VAULT_SECRET_FILE_REF).map(|reference| (reference, true)))
}

fn has_value(config: &Mapping, name: &str) -> bool {
    config.get(name).is_some_and(|value| !value.is_unset())
}
