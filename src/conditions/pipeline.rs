//! Pipeline definition document
//!
//! ```yaml
//! apiVersion: project.piper.io/v1
//! kind: PipelineDefinition
//! metadata:
//!   name: sap-piper.general.purpose.pipeline
//! spec:
//!   stages:
//!     - name: build
//!       displayName: Build
//!       steps:
//!         - name: mavenBuild
//!           conditions:
//!             - filePattern: "**/pom.xml"
//!             - config:
//!                 buildTool: [maven]
//!           notActiveConditions:
//!             - configKey: skipBuild
//!           orchestrators: [Jenkins]
//! ```
//!
//! A step is active when any of its `conditions` holds, or when it has none.
//! Any holding `notActiveConditions` entry deactivates it again. Keys this
//! reader does not know are ignored.

use crate::conditions::checks::{declares_npm_script, expand};
use crate::conditions::registry::{ConditionError, ConditionResult};
use crate::conditions::{Deactivation, GlobFn};
use crate::core::config::OpenFile;
use crate::core::context::EnvLookup;
use crate::core::value::{Mapping, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use tracing::debug;

/// Resource holding the values earlier steps handed on
pub const COMMON_PIPELINE_ENVIRONMENT: &str = "commonPipelineEnvironment";

/// Default directory of the pipeline environment
pub const DEFAULT_ENVIRONMENT_ROOT: &str = ".pipeline";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub metadata: PipelineMetadata,

    #[serde(default)]
    pub spec: PipelineSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetadata {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    #[serde(default)]
    pub name: String,

    /// Name the stage is reported and configured under
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Any one holding activates the step
    #[serde(default)]
    pub conditions: Vec<StepCondition>,

    /// Any one holding deactivates the step
    #[serde(default)]
    pub not_active_conditions: Vec<StepCondition>,

    /// Orchestrators the step exists on; all when empty
    #[serde(default)]
    pub orchestrators: Vec<String>,
}

/// One activation rule. Only the first kind that is set is checked, in
/// field order; a rule without any kind holds unless `inactive` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCondition {
    /// Exactly one config key and the values that activate
    #[serde(default)]
    pub config: Option<IndexMap<String, Vec<Value>>>,

    /// Config key that must be present; `a/b` walks into nested mappings
    #[serde(default)]
    pub config_key: String,

    #[serde(default)]
    pub file_pattern: String,

    /// Config key holding the file pattern
    #[serde(default)]
    pub file_pattern_from_config: String,

    #[serde(default)]
    pub npm_script: String,

    /// Pipeline environment entries and the values that activate
    #[serde(default)]
    pub common_pipeline_environment: Option<IndexMap<String, Value>>,

    /// Pipeline environment entry that must be filled
    #[serde(default)]
    pub pipeline_environment_filled: String,

    #[serde(default)]
    pub inactive: bool,
}

/// CI system the pipeline runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orchestrator {
    Azure,
    GitHubActions,
    Jenkins,
    Unknown,
}

impl Orchestrator {
    /// Detect the orchestrator from the variables it sets
    pub fn detect(env: &dyn EnvLookup) -> Self {
        let all_set = |names: &[&str]| {
            names.iter().all(|name| {
                env.get(name)
                    .is_some_and(|value| !value.is_empty() && value != "false")
            })
        };
        if all_set(&["AZURE_HTTP_USER_AGENT"]) {
            Orchestrator::Azure
        } else if all_set(&["GITHUB_ACTION", "GITHUB_ACTIONS"]) {
            Orchestrator::GitHubActions
        } else if all_set(&["JENKINS_HOME", "JENKINS_URL"]) {
            Orchestrator::Jenkins
        } else {
            Orchestrator::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Orchestrator::Azure => "Azure",
            Orchestrator::GitHubActions => "GitHubActions",
            Orchestrator::Jenkins => "Jenkins",
            Orchestrator::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a step condition may consult
pub struct StepConditionCall<'a> {
    pub step_name: &'a str,
    pub config: &'a Mapping,
    pub glob: &'a GlobFn,
    pub open_file: &'a OpenFile,

    /// Directory holding the pipeline environment
    pub environment_root: &'a str,
}

impl PipelineDefinition {
    pub fn from_yaml(yaml: &str) -> ConditionResult<Self> {
        Self::parse("pipeline definition", yaml)
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

    pub(crate) fn parse(document: &str, yaml: &str) -> ConditionResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(PipelineDefinition::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConditionError::Parse {
            document: document.to_string(),
            message: e.to_string(),
        })
    }

    pub fn step_count(&self) -> usize {
        self.spec.stages.iter().map(|stage| stage.steps.len()).sum()
    }
}

impl PipelineStage {
    /// The display name, or the technical name if none is given
    pub fn reported_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

impl PipelineStep {
    /// Whether the step exists on `orchestrator`
    pub fn runs_on(&self, orchestrator: Orchestrator) -> bool {
        self.orchestrators.is_empty()
            || self
                .orchestrators
                .iter()
                .any(|name| name == orchestrator.as_str())
    }

    /// `None` when the step is active, otherwise why it is not.
    /// `<stepName>: bool` in the configuration replaces `conditions`; the
    /// `notActiveConditions` apply either way.
    pub fn deactivation(&self, call: &StepConditionCall<'_>) -> ConditionResult<Option<Deactivation>> {
        let mut reason = match call.config.get(&self.name) {
            Some(Value::Bool(true)) => None,
            Some(Value::Bool(false)) => Some(Deactivation::Explicit),
            _ if self.conditions.is_empty() => None,
            _ => {
                let mut holds = false;
                for condition in &self.conditions {
                    if condition.evaluate(call)? {
                        holds = true;
                        break;
                    }
                }
                (!holds).then_some(Deactivation::NoConditionMet)
            }
        };

        for condition in &self.not_active_conditions {
            if condition.evaluate(call)? {
                debug!(
                    "Step '{}' matches not-active condition '{}'",
                    self.name,
                    condition.kind()
                );
                reason = reason.or(Some(Deactivation::NotActiveCondition {
                    condition: condition.kind().to_string(),
                }));
                break;
            }
        }
        Ok(reason)
    }
}

impl StepCondition {
    /// Name of the rule kind that is checked
    pub fn kind(&self) -> &'static str {
        if self.config.is_some() {
            "config"
        } else if !self.config_key.is_empty() {
            "configKey"
        } else if !self.file_pattern.is_empty() {
            "filePattern"
        } else if !self.file_pattern_from_config.is_empty() {
            "filePatternFromConfig"
        } else if !self.npm_script.is_empty() {
            "npmScript"
        } else if self.common_pipeline_environment.is_some() {
            "commonPipelineEnvironment"
        } else if !self.pipeline_environment_filled.is_empty() {
            "pipelineEnvironmentFilled"
        } else {
            "inactive"
        }
    }

    pub fn evaluate(&self, call: &StepConditionCall<'_>) -> ConditionResult<bool> {
        if let Some(config) = &self.config {
            if config.len() > 1 {
                return Err(ConditionError::Shape {
                    step: call.step_name.to_string(),
                    condition_ref: "config".to_string(),
                    message: format!("only one config key allowed per condition but {} provided", config.len()),
                });
            }
            return Ok(config.iter().next().is_some_and(|(key, activation_values)| {
                call.config
                    .get(key)
                    .is_some_and(|value| activation_values.contains(value))
            }));
        }

        if !self.config_key.is_empty() {
            let path: Vec<&str> = self.config_key.split('/').collect();
            return Ok(has_config_path(call.config, &path));
        }

        if !self.file_pattern.is_empty() {
            return Ok(!expand(call.glob, &self.file_pattern)?.is_empty());
        }

        if !self.file_pattern_from_config.is_empty() {
            let pattern = call
                .config
                .get(&self.file_pattern_from_config)
                .and_then(Value::to_scalar_string)
                .filter(|pattern| !pattern.is_empty());
            return match pattern {
                Some(pattern) => Ok(!expand(call.glob, &pattern)?.is_empty()),
                None => Ok(false),
            };
        }

        if !self.npm_script.is_empty() {
            return declares_npm_script(&self.npm_script, call.glob, call.open_file, |message| {
                ConditionError::Type {
                    step: call.step_name.to_string(),
                    condition_ref: "npmScript".to_string(),
                    message,
                }
            });
        }

        if let Some(entries) = &self.common_pipeline_environment {
            for (param, expected) in entries {
                if environment_value(call, param, matches!(expected, Value::String(_)))?.as_ref()
                    == Some(expected)
                {
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        if !self.pipeline_environment_filled.is_empty() {
            let param = &self.pipeline_environment_filled;
            return Ok(environment_value(call, param, true)?.is_some()
                || environment_value(call, param, false)?.is_some());
        }

        Ok(!self.inactive)
    }
}

/// Whether the nested key path exists; only the last key may hold null
fn has_config_path(config: &Mapping, path: &[&str]) -> bool {
    match path {
        [] => false,
        [last] => config.contains_key(*last),
        [first, rest @ ..] => config
            .get(*first)
            .and_then(Value::as_mapping)
            .is_some_and(|nested| has_config_path(nested, rest)),
    }
}

/// Pipeline environment entry `param`: the raw file content for strings,
/// the parsed `<param>.json` content otherwise. Missing or empty entries
/// are `None`.
fn environment_value(call: &StepConditionCall<'_>, param: &str, as_string: bool) -> ConditionResult<Option<Value>> {
    let base = format!(
        "{}/{}/{}",
        call.environment_root.trim_end_matches('/'),
        COMMON_PIPELINE_ENVIRONMENT,
        param
    );
    let path = if as_string { base } else { format!("{}.json", base) };

    let mut content = String::new();
    match (call.open_file)(&path) {
        Ok(mut reader) => reader
            .read_to_string(&mut content)
            .map_err(|source| ConditionError::Io {
                path: path.clone(),
                source,
            })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ConditionError::Io { path, source }),
    };
    if content.is_empty() {
        return Ok(None);
    }
    if as_string {
        return Ok(Some(Value::String(content)));
    }
    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(parsed) => Ok(Some(Value::from(parsed))),
        Err(e) => {
            debug!("Ignoring unparsable pipeline environment entry {}: {}", path, e);
            Ok(None)
        }
    }
}
