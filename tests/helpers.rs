//! Test doubles shared by the scenario and integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use stepconf::conditions::GlobFn;
use stepconf::core::{OpenFile, SecretRegistry, StepData};
use stepconf::secrets::{KvSecretStore, SecretData, SecretError, SecretResult, TokenIssuer};

use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Mutex};

/// KV store answering from a fixed map and recording every queried path
#[derive(Default)]
pub struct MockKvStore {
    secrets: HashMap<String, SecretData>,
    failing: Vec<String>,
    blocking: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl MockKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, path: &str, fields: &[(&str, &str)]) -> Self {
        let data = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.secrets.insert(path.to_string(), data);
        self
    }

    /// Queries of `path` fail with a store error
    pub fn failing_at(mut self, path: &str) -> Self {
        self.failing.push(path.to_string());
        self
    }

    /// Queries of `path` never complete
    pub fn blocking_at(mut self, path: &str) -> Self {
        self.blocking.push(path.to_string());
        self
    }

    /// Paths queried so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl KvSecretStore for MockKvStore {
    async fn get_kv_secret(&self, path: &str) -> SecretResult<Option<SecretData>> {
        self.calls.lock().unwrap().push(path.to_string());
        if self.blocking.iter().any(|p| p == path) {
            return std::future::pending().await;
        }
        if self.failing.iter().any(|p| p == path) {
            return Err(SecretError::Store {
                path: path.to_string(),
                message: "mock failure".to_string(),
            });
        }
        Ok(self.secrets.get(path).cloned())
    }
}

/// Token issuer answering from a fixed map, or failing every request
#[derive(Default)]
pub struct MockTokenIssuer {
    tokens: HashMap<String, String>,
    fail: bool,
    requests: Mutex<Vec<Vec<String>>>,
}

impl MockTokenIssuer {
    pub fn new(tokens: &[(&str, &str)]) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenIssuer for MockTokenIssuer {
    async fn issue_tokens(&self, systems: &[String]) -> SecretResult<HashMap<String, String>> {
        self.requests.lock().unwrap().push(systems.to_vec());
        if self.fail {
            return Err(SecretError::Http {
                url: "mock://trust".to_string(),
                message: "unexpected status 500".to_string(),
            });
        }
        Ok(systems
            .iter()
            .filter_map(|s| self.tokens.get(s).map(|t| (s.clone(), t.clone())))
            .collect())
    }
}

/// Glob answering from a pattern → paths map; unknown patterns match nothing
pub fn map_glob(entries: &[(&str, &[&str])]) -> Arc<GlobFn> {
    let map: HashMap<String, Vec<String>> = entries
        .iter()
        .map(|(pattern, paths)| {
            (
                pattern.to_string(),
                paths.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect();
    Arc::new(move |pattern: &str| -> io::Result<Vec<String>> {
        Ok(map.get(pattern).cloned().unwrap_or_default())
    })
}

/// File opener serving in-memory contents; unknown names are not found
pub fn memory_files(files: &[(&str, &str)]) -> Arc<OpenFile> {
    let files: HashMap<String, String> = files
        .iter()
        .map(|(name, content)| (name.to_string(), content.to_string()))
        .collect();
    Arc::new(move |name: &str| -> io::Result<Box<dyn Read>> {
        match files.get(name) {
            Some(content) => Ok(Box::new(Cursor::new(content.clone().into_bytes()))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, name.to_string())),
        }
    })
}

/// Private secret registry, to inspect what a resolver registered
pub fn registry() -> Arc<SecretRegistry> {
    Arc::new(SecretRegistry::new())
}

/// Parse step metadata, panicking on invalid test input
pub fn metadata(yaml: &str) -> StepData {
    StepData::from_yaml(yaml).expect("test metadata parses")
}
