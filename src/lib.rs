//! stepconf - layered step configuration and stage condition evaluation
//! for CI/CD pipelines

pub mod cli;
pub mod conditions;
pub mod core;
pub mod secrets;

// Re-export commonly used types
pub use conditions::{
    ConditionError, ConditionRegistry, Deactivation, PipelineDefinition, RunConfig, StageConfig, StageDefinition,
};
pub use self::core::{
    ConfigDocuments, ConfigError, Mapping, ResolutionContext, StepConfig, StepConfigRequest, StepData,
    StepFilters, Value,
};
pub use secrets::{KvSecretStore, SecretError, SecretResolver, TokenIssuer};
