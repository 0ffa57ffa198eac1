//! Trust service client
//!
//! The trust service exchanges a bearer token for per-system secrets:
//!
//! ```text
//! POST <serverURL>/<tokenEndPoint>
//! [{"system": "sonar", "scope": "pipeline"}]
//! -> {"sonar": "<token>"}
//! ```

use crate::core::value::{Mapping, Value};
use crate::secrets::{SecretError, SecretResult};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Hook configuration section holding the trust service settings
pub const TRUST_ENGINE_HOOK: &str = "trustEngine";

/// Environment variable carrying the trust service token
pub const TRUST_ENGINE_TOKEN_ENV: &str = "PIPER_trustEngineToken";

/// Connection settings of the trust service
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TrustConfig {
    pub server_url: String,
    pub token_end_point: String,

    /// When set, the requested systems are also passed as this query parameter
    pub token_query_param_name: String,

    pub token: String,
}

impl fmt::Debug for TrustConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustConfig")
            .field("server_url", &self.server_url)
            .field("token_end_point", &self.token_end_point)
            .field("token_query_param_name", &self.token_query_param_name)
            .field("token", &"****")
            .finish()
    }
}

impl TrustConfig {
    /// Settings from `hooks.trustEngine`; `None` without a server URL
    pub fn from_hook_config(hook_config: &Mapping, token: impl Into<String>) -> Option<Self> {
        let section = hook_config.get(TRUST_ENGINE_HOOK)?.as_mapping()?;
        let field = |name: &str| {
            section
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let server_url = field("serverURL");
        if server_url.is_empty() {
            return None;
        }
        Some(Self {
            server_url,
            token_end_point: field("tokenEndPoint"),
            token_query_param_name: field("tokenQueryParamName"),
            token: token.into(),
        })
    }

    /// Endpoint URL for a request on behalf of `systems`
    pub fn token_url(&self, systems: &[String]) -> String {
        let mut url = format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.token_end_point.trim_start_matches('/')
        );
        if !self.token_query_param_name.is_empty() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&self.token_query_param_name);
            url.push('=');
            url.push_str(&systems.join(","));
        }
        url
    }
}

/// Issues tokens for named systems
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Tokens keyed by system name; systems unknown to the issuer are absent
    async fn issue_tokens(&self, systems: &[String]) -> SecretResult<HashMap<String, String>>;
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    system: &'a str,
    scope: &'a str,
}

/// HTTP client of the trust service
#[derive(Debug, Clone)]
pub struct TrustClient {
    client: reqwest::Client,
    config: TrustConfig,
}

impl TrustClient {
    pub fn new(config: TrustConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }
}

#[async_trait]
impl TokenIssuer for TrustClient {
    async fn issue_tokens(&self, systems: &[String]) -> SecretResult<HashMap<String, String>> {
        let url = self.config.token_url(systems);
        let body: Vec<TokenRequest<'_>> = systems
            .iter()
            .map(|system| TokenRequest {
                system,
                scope: "pipeline",
            })
            .collect();
        debug!("Requesting {} token(s) from the trust engine", body.len());

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.config.token))
            .json(&body)
            .send()
            .await
            .map_err(|e| SecretError::Http {
                url: url.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(SecretError::Http {
                url,
                message: format!("unexpected status {}", status),
            });
        }

        response.json().await.map_err(|e| SecretError::Http {
            url,
            message: format!("invalid response: {}", e),
        })
    }
}
