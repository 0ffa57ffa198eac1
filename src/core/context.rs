//! Resolution context - collaborators injected into the merger and resolver
//!
//! Environment lookup, secret redaction and the clock are process-wide in a
//! real run. They are passed in explicitly so tests can build a hermetic
//! context without touching the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::warn;

/// Read access to environment variables
pub trait EnvLookup: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Environment lookup backed by the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Environment lookup backed by an in-memory map
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvLookup for MapEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// Receives every secret value so that later log output can mask it
pub trait SecretSink: Send + Sync {
    fn register(&self, secret: &str);
}

/// Set of known secret values. Registration only ever grows the set.
#[derive(Debug, Default)]
pub struct SecretRegistry {
    secrets: RwLock<Vec<String>>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<SecretRegistry>> = OnceLock::new();

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> Arc<SecretRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(SecretRegistry::new()))
            .clone()
    }

    pub fn secrets(&self) -> Vec<String> {
        self.secrets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn contains(&self, secret: &str) -> bool {
        self.secrets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|s| s == secret)
    }

    /// Replace every registered secret in `text` with `****`
    pub fn redact(&self, text: &str) -> String {
        let secrets = self
            .secrets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "****"))
    }
}

impl SecretSink for SecretRegistry {
    fn register(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !secrets.iter().any(|s| s == secret) {
            secrets.push(secret.to_string());
        }
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a fixed instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A deprecated alias that was used during resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeprecationNote {
    /// The alias found in a document
    pub alias: String,

    /// Canonical parameter name the alias maps to
    pub parameter: String,

    /// Step being resolved when the alias was seen
    pub step: String,

    /// When the alias was first seen
    pub timestamp: DateTime<Utc>,
}

/// Collaborators for one resolution run
pub struct ResolutionContext {
    pub env: Arc<dyn EnvLookup>,
    pub secrets: Arc<dyn SecretSink>,
    pub clock: Arc<dyn Clock>,
    notes: Mutex<Vec<DeprecationNote>>,
}

impl ResolutionContext {
    pub fn new(
        env: Arc<dyn EnvLookup>,
        secrets: Arc<dyn SecretSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            env,
            secrets,
            clock,
            notes: Mutex::new(Vec::new()),
        }
    }

    /// Context bound to the real process environment, the global secret
    /// registry and the system clock
    pub fn from_process() -> Self {
        Self::new(
            Arc::new(ProcessEnv),
            SecretRegistry::global(),
            Arc::new(SystemClock),
        )
    }

    /// Context with an empty environment and a private secret registry
    pub fn hermetic() -> Self {
        Self::new(
            Arc::new(MapEnv::new()),
            Arc::new(SecretRegistry::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn with_env(mut self, env: Arc<dyn EnvLookup>) -> Self {
        self.env = env;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretSink>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record the use of a deprecated alias. Warns only the first time a
    /// given alias is seen by this context; returns whether it warned.
    pub fn note_deprecated_alias(&self, alias: &str, parameter: &str, step: &str) -> bool {
        let mut notes = self
            .notes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if notes.iter().any(|note| note.alias == alias) {
            return false;
        }
        warn!(
            "Step '{}': deprecated alias '{}' is used for parameter '{}', please use '{}' instead",
            step, alias, parameter, parameter
        );
        notes.push(DeprecationNote {
            alias: alias.to_string(),
            parameter: parameter.to_string(),
            step: step.to_string(),
            timestamp: self.clock.now(),
        });
        true
    }

    pub fn deprecation_notes(&self) -> Vec<DeprecationNote> {
        self.notes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl fmt::Debug for ResolutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionContext")
            .field("deprecation_notes", &self.deprecation_notes().len())
            .finish_non_exhaustive()
    }
}
