//! Step activation from stage conditions
//!
//! Two document formats are understood. In the stage condition document
//! every listed step starts out active; its conditions are evaluated in
//! order and the first one that does not hold deactivates the step. A
//! deactivated step never becomes active again. The pipeline definition
//! format is described in [`pipeline`].

pub mod checks;
pub mod pipeline;
pub mod registry;
pub mod stage;

pub use pipeline::{Orchestrator, PipelineDefinition, PipelineStep, StepCondition, StepConditionCall};
pub use registry::{ConditionCall, ConditionError, ConditionRegistry, ConditionResult};
pub use stage::{ConditionParam, ParamValue, PipelineConditions, PipelineTaskCondition, StageConfig};

use crate::core::config::{open_local_file, ConfigDocuments, OpenFile, StepConfig, StepConfigRequest};
use crate::core::context::{ProcessEnv, ResolutionContext};
use crate::core::error::ConfigResult;
use crate::core::metadata::StepData;
use crate::core::value::{Mapping, Value};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Expands a file pattern into matching paths
pub type GlobFn = dyn Fn(&str) -> io::Result<Vec<String>> + Send + Sync;

/// Expand `pattern` against the working directory. `**` spans directories,
/// `*` stays within one path segment.
pub fn filesystem_glob(pattern: &str) -> io::Result<Vec<String>> {
    let options = glob::MatchOptions {
        require_literal_separator: true,
        ..glob::MatchOptions::default()
    };
    let paths = glob::glob_with(pattern, options)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    paths
        .map(|entry| {
            entry
                .map(|path| path.to_string_lossy().into_owned())
                .map_err(|e| e.into_error())
        })
        .collect()
}

/// Value of `key` for `step_name`: the flat key first, then `general`,
/// `stages.<step>` and `steps.<step>`. Null counts as absent.
pub fn step_config_lookup<'m>(config: &'m Mapping, step_name: &str, key: &str) -> Option<&'m Value> {
    let present = |value: Option<&'m Value>| value.filter(|v| !v.is_null());
    let section = |name: &str| config.get(name).and_then(Value::as_mapping);

    present(config.get(key))
        .or_else(|| present(section("general").and_then(|general| general.get(key))))
        .or_else(|| {
            present(
                section("stages")
                    .and_then(|stages| stages.get(step_name))
                    .and_then(Value::as_mapping)
                    .and_then(|stage| stage.get(key)),
            )
        })
        .or_else(|| {
            present(
                section("steps")
                    .and_then(|steps| steps.get(step_name))
                    .and_then(Value::as_mapping)
                    .and_then(|step| step.get(key)),
            )
        })
}

/// Supplies the configuration a step's conditions are evaluated against
pub trait StepConfigProvider {
    fn step_config(&self, stage_name: &str, step_name: &str) -> ConfigResult<Mapping>;
}

impl<F> StepConfigProvider for F
where
    F: Fn(&str, &str) -> ConfigResult<Mapping>,
{
    fn step_config(&self, stage_name: &str, step_name: &str) -> ConfigResult<Mapping> {
        self(stage_name, step_name)
    }
}

/// Resolves each step from the configuration documents, without flags or
/// parameter JSON, and attaches the raw project sections for lookups
pub struct DocumentStepConfigs<'a> {
    documents: &'a ConfigDocuments,
    metadata: HashMap<String, StepData>,
    ctx: &'a ResolutionContext,
}

impl<'a> DocumentStepConfigs<'a> {
    pub fn new(documents: &'a ConfigDocuments, ctx: &'a ResolutionContext) -> Self {
        Self {
            documents,
            metadata: HashMap::new(),
            ctx,
        }
    }

    /// Use the parameters and filters of this step metadata for its step
    pub fn with_metadata(mut self, metadata: StepData) -> Self {
        self.metadata.insert(metadata.metadata.name.clone(), metadata);
        self
    }
}

impl StepConfigProvider for DocumentStepConfigs<'_> {
    fn step_config(&self, stage_name: &str, step_name: &str) -> ConfigResult<Mapping> {
        let mut request = StepConfigRequest::new(stage_name, step_name);
        if let Some(metadata) = self.metadata.get(step_name) {
            request = request.with_metadata(metadata);
        }
        let mut config = StepConfig::resolve(self.documents, &request, self.ctx)?.config;

        let project = &self.documents.config;
        let sections = [
            ("general", Value::Mapping(project.general.clone())),
            ("stages", sections_value(&project.stages)),
            ("steps", sections_value(&project.steps)),
        ];
        for (name, value) in sections {
            config.entry(name.to_string()).or_insert(value);
        }
        Ok(config)
    }
}

fn sections_value(sections: &std::collections::BTreeMap<String, Mapping>) -> Value {
    Value::Mapping(
        sections
            .iter()
            .map(|(name, section)| (name.clone(), Value::Mapping(section.clone())))
            .collect(),
    )
}

/// A stage condition document in either format
#[derive(Debug, Clone, PartialEq)]
pub enum StageDefinition {
    /// `stages.<stage>.stepConditions.<step>.conditions[]` with `conditionRef`s
    Conditions(StageConfig),
    /// `spec.stages[].steps[]` with OR-combined conditions
    Pipeline(PipelineDefinition),
}

impl StageDefinition {
    /// Parse either format; a top-level `spec` key selects the pipeline
    /// definition
    pub fn from_yaml(yaml: &str) -> ConditionResult<Self> {
        Self::parse("stage configuration", yaml)
    }

    pub fn from_reader<R: Read>(document: &str, mut reader: R) -> ConditionResult<Self> {
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .map_err(|source| ConditionError::Io {
                path: document.to_string(),
                source,
            })?;
        Self::parse(document, &content)
    }

    fn parse(document: &str, yaml: &str) -> ConditionResult<Self> {
        let root: Option<serde_yaml::Mapping> = serde_yaml::from_str(yaml).unwrap_or(None);
        let has_spec = root.is_some_and(|root| root.contains_key("spec"));
        if has_spec {
            PipelineDefinition::parse(document, yaml).map(StageDefinition::Pipeline)
        } else {
            StageConfig::parse(document, yaml).map(StageDefinition::Conditions)
        }
    }

    /// Number of steps the document decides on
    pub fn step_count(&self) -> usize {
        match self {
            StageDefinition::Conditions(config) => config.step_count(),
            StageDefinition::Pipeline(definition) => definition.step_count(),
        }
    }
}

impl From<StageConfig> for StageDefinition {
    fn from(config: StageConfig) -> Self {
        StageDefinition::Conditions(config)
    }
}

impl From<PipelineDefinition> for StageDefinition {
    fn from(definition: PipelineDefinition) -> Self {
        StageDefinition::Pipeline(definition)
    }
}

/// Why a step was deactivated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Deactivation {
    /// The step's own configuration holds `<stepName>: false`
    Explicit,
    /// A condition evaluated to false
    Condition { condition_ref: String },
    /// None of the step's activation conditions holds
    NoConditionMet,
    /// One of the step's not-active conditions holds
    NotActiveCondition { condition: String },
}

/// Activation state of every step of one pipeline evaluation
pub struct RunConfig {
    pub definition: StageDefinition,

    /// stage → step → active
    pub run_steps: IndexMap<String, IndexMap<String, bool>>,

    /// stage → whether any step of the stage is active
    pub run_stages: IndexMap<String, bool>,

    /// stage → step → reason, for inactive steps only
    pub deactivations: IndexMap<String, IndexMap<String, Deactivation>>,

    /// Identifies this evaluation in log output
    pub evaluation_id: Uuid,

    glob: Arc<GlobFn>,
    open_file: Arc<OpenFile>,
    registry: ConditionRegistry,
    orchestrator: Orchestrator,
    environment_root: String,
}

/// Outcome of one stage
struct StageRun {
    name: String,
    steps: IndexMap<String, bool>,
    reasons: IndexMap<String, Deactivation>,
}

impl StageRun {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: IndexMap::new(),
            reasons: IndexMap::new(),
        }
    }

    fn record(&mut self, step_name: &str, reason: Option<Deactivation>) {
        debug!(
            "Stage '{}' step '{}' active: {}",
            self.name,
            step_name,
            reason.is_none()
        );
        self.steps.insert(step_name.to_string(), reason.is_none());
        if let Some(reason) = reason {
            self.reasons.insert(step_name.to_string(), reason);
        }
    }
}

impl RunConfig {
    /// Run configuration using the filesystem, the process environment and
    /// the built-in conditions
    pub fn new(definition: impl Into<StageDefinition>) -> Self {
        Self {
            definition: definition.into(),
            run_steps: IndexMap::new(),
            run_stages: IndexMap::new(),
            deactivations: IndexMap::new(),
            evaluation_id: Uuid::new_v4(),
            glob: Arc::new(filesystem_glob),
            open_file: Arc::new(open_local_file),
            registry: ConditionRegistry::new(),
            orchestrator: Orchestrator::detect(&ProcessEnv),
            environment_root: pipeline::DEFAULT_ENVIRONMENT_ROOT.to_string(),
        }
    }

    pub fn with_glob(mut self, glob: Arc<GlobFn>) -> Self {
        self.glob = glob;
        self
    }

    pub fn with_open_file(mut self, open_file: Arc<OpenFile>) -> Self {
        self.open_file = open_file;
        self
    }

    pub fn with_registry(mut self, registry: ConditionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Orchestrator that decides which orchestrator-specific steps exist
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Directory holding the pipeline environment
    pub fn with_environment_root(mut self, root: impl Into<String>) -> Self {
        self.environment_root = root.into();
        self
    }

    /// Evaluate all stage conditions. The first error aborts evaluation.
    pub fn evaluate(&mut self, provider: &dyn StepConfigProvider) -> ConditionResult<()> {
        info!(
            "Evaluating conditions of {} step(s) (evaluation {})",
            self.definition.step_count(),
            self.evaluation_id
        );

        let stages = match &self.definition {
            StageDefinition::Conditions(config) => self.evaluate_conditions(config, provider)?,
            StageDefinition::Pipeline(definition) => self.evaluate_pipeline(definition, provider)?,
        };

        for stage in stages {
            let stage_active = stage.steps.values().any(|active| *active);
            self.run_stages.insert(stage.name.clone(), stage_active);
            self.run_steps.insert(stage.name.clone(), stage.steps);
            if !stage.reasons.is_empty() {
                self.deactivations.insert(stage.name, stage.reasons);
            }
        }
        Ok(())
    }

    fn evaluate_conditions(
        &self,
        stage_config: &StageConfig,
        provider: &dyn StepConfigProvider,
    ) -> ConditionResult<Vec<StageRun>> {
        let mut stages = Vec::new();
        for (stage_name, stage) in &stage_config.stages {
            let mut run = StageRun::new(stage_name);
            for (step_name, conditions) in &stage.step_conditions {
                let config = step_config(provider, stage_name, step_name)?;
                let reason = self.deactivation(step_name, conditions, &config)?;
                run.record(step_name, reason);
            }
            stages.push(run);
        }
        Ok(stages)
    }

    fn evaluate_pipeline(
        &self,
        definition: &PipelineDefinition,
        provider: &dyn StepConfigProvider,
    ) -> ConditionResult<Vec<StageRun>> {
        let mut stages = Vec::new();
        for stage in &definition.spec.stages {
            let stage_name = stage.reported_name();
            let mut run = StageRun::new(stage_name);
            for step in &stage.steps {
                if !step.runs_on(self.orchestrator) {
                    debug!(
                        "Step '{}' does not run on {}, skipping",
                        step.name, self.orchestrator
                    );
                    continue;
                }
                let config = step_config(provider, stage_name, &step.name)?;
                let reason = step.deactivation(&StepConditionCall {
                    step_name: &step.name,
                    config: &config,
                    glob: self.glob.as_ref(),
                    open_file: self.open_file.as_ref(),
                    environment_root: &self.environment_root,
                })?;
                run.record(&step.name, reason);
            }
            stages.push(run);
        }
        Ok(stages)
    }

    fn deactivation(
        &self,
        step_name: &str,
        conditions: &PipelineConditions,
        config: &Mapping,
    ) -> ConditionResult<Option<Deactivation>> {
        match config.get(step_name) {
            Some(Value::Bool(false)) => return Ok(Some(Deactivation::Explicit)),
            Some(Value::Bool(true)) => return Ok(None),
            _ => {}
        }
        for condition in &conditions.conditions {
            let holds = self.registry.evaluate(
                condition,
                step_name,
                config,
                self.glob.as_ref(),
                self.open_file.as_ref(),
            )?;
            if !holds {
                return Ok(Some(Deactivation::Condition {
                    condition_ref: condition.condition_ref.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Activation of a step; `None` if the step has no stage conditions
    pub fn step_active(&self, stage_name: &str, step_name: &str) -> Option<bool> {
        self.run_steps
            .get(stage_name)
            .and_then(|steps| steps.get(step_name))
            .copied()
    }

    pub fn stage_active(&self, stage_name: &str) -> Option<bool> {
        self.run_stages.get(stage_name).copied()
    }

    pub fn deactivation_reason(&self, stage_name: &str, step_name: &str) -> Option<&Deactivation> {
        self.deactivations
            .get(stage_name)
            .and_then(|steps| steps.get(step_name))
    }
}

fn step_config(provider: &dyn StepConfigProvider, stage_name: &str, step_name: &str) -> ConditionResult<Mapping> {
    provider
        .step_config(stage_name, step_name)
        .map_err(|source| ConditionError::Config {
            step: step_name.to_string(),
            source,
        })
}
