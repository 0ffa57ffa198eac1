//! Condition dispatch by `conditionRef`

use crate::conditions::checks;
use crate::conditions::stage::{ConditionParam, PipelineTaskCondition};
use crate::conditions::GlobFn;
use crate::core::config::OpenFile;
use crate::core::error::ConfigError;
use crate::core::value::Mapping;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while reading or evaluating stage conditions
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Failed to parse {document}: {message}")]
    Parse { document: String, message: String },

    #[error("Condition '{condition_ref}' of step '{step}' is malformed: {message}")]
    Shape {
        step: String,
        condition_ref: String,
        message: String,
    },

    #[error("Condition '{condition_ref}' of step '{step}': {message}")]
    Type {
        step: String,
        condition_ref: String,
        message: String,
    },

    #[error("Unknown conditionRef '{condition_ref}' for step '{step}'")]
    Registration { step: String, condition_ref: String },

    #[error("Failed to expand file pattern '{pattern}': {source}")]
    Glob {
        pattern: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to resolve configuration of step '{step}': {source}")]
    Config {
        step: String,
        #[source]
        source: ConfigError,
    },
}

/// Result type for condition operations
pub type ConditionResult<T> = Result<T, ConditionError>;

/// Everything a condition handler may consult
pub struct ConditionCall<'a> {
    pub step_name: &'a str,
    pub condition_ref: &'a str,
    pub params: &'a [ConditionParam],

    /// Step configuration, with the raw `general`, `stages` and `steps`
    /// sections attached for lookups
    pub config: &'a Mapping,

    pub glob: &'a GlobFn,
    pub open_file: &'a OpenFile,
}

impl ConditionCall<'_> {
    pub fn shape_error(&self, message: impl Into<String>) -> ConditionError {
        ConditionError::Shape {
            step: self.step_name.to_string(),
            condition_ref: self.condition_ref.to_string(),
            message: message.into(),
        }
    }

    pub fn type_error(&self, message: impl Into<String>) -> ConditionError {
        ConditionError::Type {
            step: self.step_name.to_string(),
            condition_ref: self.condition_ref.to_string(),
            message: message.into(),
        }
    }

    /// Fail unless exactly `count` params are given
    pub fn expect_params(&self, count: usize) -> ConditionResult<()> {
        if self.params.len() != count {
            return Err(self.shape_error(format!(
                "{} parameter(s) required, got {}",
                count,
                self.params.len()
            )));
        }
        Ok(())
    }
}

/// A condition implementation
pub type ConditionHandler = dyn Fn(&ConditionCall<'_>) -> ConditionResult<bool> + Send + Sync;

/// Maps `conditionRef` names to their handlers
#[derive(Clone)]
pub struct ConditionRegistry {
    handlers: HashMap<String, Arc<ConditionHandler>>,
}

impl ConditionRegistry {
    /// Registry without any condition
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry holding the built-in conditions
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(checks::CONFIG_EQUALS, checks::config_equals);
        registry.register(checks::CONFIG_EXISTS, checks::config_exists);
        registry.register(checks::FILE_EXISTS, checks::file_exists);
        registry.register(checks::IS_ACTIVE, checks::is_active);
        registry.register(checks::NPM_SCRIPT_EXISTS, checks::npm_script_exists);
        registry
    }

    /// Add or replace a condition
    pub fn register<F>(&mut self, condition_ref: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&ConditionCall<'_>) -> ConditionResult<bool> + Send + Sync + 'static,
    {
        self.handlers.insert(condition_ref.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, condition_ref: &str) -> bool {
        self.handlers.contains_key(condition_ref)
    }

    /// Evaluate one condition of `step_name`
    pub fn evaluate(
        &self,
        condition: &PipelineTaskCondition,
        step_name: &str,
        config: &Mapping,
        glob: &GlobFn,
        open_file: &OpenFile,
    ) -> ConditionResult<bool> {
        let handler = self.handlers.get(&condition.condition_ref).ok_or_else(|| {
            ConditionError::Registration {
                step: step_name.to_string(),
                condition_ref: condition.condition_ref.clone(),
            }
        })?;
        let call = ConditionCall {
            step_name,
            condition_ref: &condition.condition_ref,
            params: &condition.params,
            config,
            glob,
            open_file,
        };
        handler(&call)
    }
}

impl Default for ConditionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ConditionRegistry")
            .field("conditions", &names)
            .finish()
    }
}
