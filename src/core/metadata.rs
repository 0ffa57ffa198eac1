//! Step metadata - parameter descriptors and scope filters
//!
//! Every step ships a metadata document describing its inputs. The merger
//! only needs the parameter descriptors: their scopes decide which sources
//! may set them, their aliases decide which legacy names are honoured and
//! their resource references point at secret providers.

use crate::core::error::{ConfigError, ConfigResult};
use crate::core::value::{Mapping, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;

/// Resource reference type resolved from the KV secret store
pub const VAULT_SECRET_REF: &str = "vaultSecret";

/// Resource reference type resolved from the KV secret store into a
/// temporary file; the parameter receives the file path
pub const VAULT_SECRET_FILE_REF: &str = "vaultSecretFile";

/// Resource reference type resolved from the trust service
pub const TRUST_ENGINE_SECRET_REF: &str = "trustengineSecret";

/// Settings of a step's execution container
pub const CONTAINER_PARAMETERS: &[&str] = &[
    "containerCommand",
    "containerShell",
    "dockerEnvVars",
    "dockerImage",
    "dockerName",
    "dockerOptions",
    "dockerPullImage",
    "dockerVolumeBind",
    "dockerWorkspace",
];

/// Settings of a sidecar container
pub const SIDECAR_PARAMETERS: &[&str] = &[
    "containerName",
    "containerPortMappings",
    "dockerName",
    "sidecarEnvVars",
    "sidecarImage",
    "sidecarName",
    "sidecarOptions",
    "sidecarPullImage",
    "sidecarReadyCommand",
    "sidecarVolumeBind",
    "sidecarWorkspace",
];

/// Parameter that is always configurable, whatever the step declares
pub const VERBOSE_PARAMETER: &str = "verbose";

/// Settings read by the KV secret lookup, configurable in any scope but env
/// once a step references a KV secret
pub const VAULT_CONFIG_PARAMETERS: &[&str] = &[
    "vaultServerUrl",
    "vaultNamespace",
    "vaultPath",
    "vaultBasePath",
    "vaultPipelineName",
    "vaultCredentialPath",
    "vaultCredentialKeys",
    "vaultCredentialEnvPrefix",
    "vaultTestCredentialPath",
    "vaultTestCredentialKeys",
    "vaultTestCredentialEnvPrefix",
];

/// Top-level step metadata document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepData {
    pub metadata: StepMetadata,

    #[serde(default)]
    pub spec: StepSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StepMetadata {
    pub name: String,

    #[serde(default)]
    pub aliases: Vec<Alias>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub long_description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    #[serde(default)]
    pub inputs: StepInputs,

    /// Output resources, carried through untouched
    #[serde(default)]
    pub outputs: Option<Value>,

    /// Execution containers; their settings become configurable context
    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default)]
    pub sidecars: Vec<Container>,
}

/// Container a step runs in, or a sidecar next to it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub shell: String,

    #[serde(default)]
    pub working_dir: String,

    #[serde(default)]
    pub ready_command: String,

    #[serde(default)]
    pub image_pull_policy: String,

    #[serde(default)]
    pub env: Vec<Value>,

    #[serde(default)]
    pub options: Vec<Value>,

    /// Selects the container by the value of another parameter
    #[serde(default)]
    pub conditions: Vec<ParameterCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepInputs {
    #[serde(default)]
    pub params: Vec<StepParameter>,

    #[serde(default)]
    pub resources: Vec<StepResource>,

    #[serde(default)]
    pub secrets: Vec<StepSecret>,
}

/// Places a parameter may be configured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    General,
    Steps,
    Stages,
    Parameters,
    Env,
}

/// Declared parameter type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParameterType {
    #[default]
    String,
    Bool,
    Int,
    StringList,
    /// Interpreted types such as `JenkinsScript` or `map[string]interface{}`
    Other(String),
}

impl From<String> for ParameterType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "string" => ParameterType::String,
            "bool" => ParameterType::Bool,
            "int" => ParameterType::Int,
            "[]string" => ParameterType::StringList,
            _ => ParameterType::Other(s),
        }
    }
}

impl From<ParameterType> for String {
    fn from(t: ParameterType) -> Self {
        match t {
            ParameterType::String => "string".to_string(),
            ParameterType::Bool => "bool".to_string(),
            ParameterType::Int => "int".to_string(),
            ParameterType::StringList => "[]string".to_string(),
            ParameterType::Other(s) => s,
        }
    }
}

impl ParameterType {
    /// Convert a raw flag value into a value of this type
    pub fn coerce(&self, name: &str, raw: &str) -> ConfigResult<Value> {
        match self {
            ParameterType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(ConfigError::Type {
                    key: name.to_string(),
                    expected: "bool",
                    found: "string",
                }),
            },
            ParameterType::Int => raw.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                ConfigError::Type {
                    key: name.to_string(),
                    expected: "int",
                    found: "string",
                }
            }),
            ParameterType::StringList => Ok(Value::Sequence(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Value::from)
                    .collect(),
            )),
            ParameterType::String | ParameterType::Other(_) => Ok(Value::from(raw)),
        }
    }
}

/// A prior name of a parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Alias {
    /// Alias name; `a/b` addresses the nested value `a.b`
    pub name: String,

    #[serde(default)]
    pub deprecated: bool,
}

/// Pointer from a parameter to an external secret source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceReference {
    pub name: String,

    #[serde(default, rename = "type")]
    pub ref_type: String,

    #[serde(default)]
    pub param: Option<String>,

    /// Path templates for KV lookups, tried in order
    #[serde(default)]
    pub paths: Vec<String>,

    /// Fallback identifier, e.g. the system name for the trust service
    #[serde(default)]
    pub default: Option<String>,

    #[serde(default)]
    pub aliases: Vec<Alias>,
}

/// A `{name, value}` pair feeding a parameter condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionParam {
    pub name: String,
    pub value: String,
}

/// Makes a parameter depend on the value of another parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ParameterCondition {
    #[serde(default)]
    pub condition_ref: String,

    #[serde(default)]
    pub params: Vec<ConditionParam>,
}

/// Parameter descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StepParameter {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub long_description: String,

    #[serde(default)]
    pub resource_ref: Vec<ResourceReference>,

    /// Missing scope means the parameter is only settable through
    /// parameter JSON or flags
    #[serde(default)]
    pub scope: Vec<Scope>,

    #[serde(default, rename = "type")]
    pub param_type: ParameterType,

    #[serde(default)]
    pub mandatory: bool,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub possible_values: Option<Vec<Value>>,

    #[serde(default)]
    pub aliases: Vec<Alias>,

    #[serde(default)]
    pub conditions: Vec<ParameterCondition>,

    #[serde(default)]
    pub secret: bool,
}

impl StepParameter {
    /// First resource reference of the given type
    pub fn reference(&self, ref_type: &str) -> Option<&ResourceReference> {
        self.resource_ref.iter().find(|r| r.ref_type == ref_type)
    }

    /// Parameter name followed by the names of its dependent parameters
    fn filter_keys(&self) -> Vec<String> {
        std::iter::once(self.name.clone())
            .chain(
                self.conditions
                    .iter()
                    .flat_map(|c| c.params.iter().map(|p| p.value.clone())),
            )
            .collect()
    }

    /// The first dependent `{name, value}` pair, if the parameter is conditional
    pub fn dependency(&self) -> Option<&ConditionParam> {
        self.conditions.first().and_then(|c| c.params.first())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSecret {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, rename = "type")]
    pub secret_type: String,

    #[serde(default)]
    pub aliases: Vec<Alias>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepResource {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, rename = "type")]
    pub resource_type: String,

    #[serde(default)]
    pub params: Vec<Value>,

    #[serde(default)]
    pub conditions: Vec<ParameterCondition>,
}

/// Parameter names allowed per source scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFilters {
    pub all: Vec<String>,
    pub general: Vec<String>,
    pub steps: Vec<String>,
    pub stages: Vec<String>,
    pub parameters: Vec<String>,
    pub env: Vec<String>,
}

impl StepFilters {
    /// Append every list of `other` to the matching list of `self`
    pub fn extend(&mut self, other: StepFilters) {
        self.all.extend(other.all);
        self.general.extend(other.general);
        self.steps.extend(other.steps);
        self.stages.extend(other.stages);
        self.parameters.extend(other.parameters);
        self.env.extend(other.env);
    }

    fn scope_mut(&mut self, scope: Scope) -> &mut Vec<String> {
        match scope {
            Scope::General => &mut self.general,
            Scope::Steps => &mut self.steps,
            Scope::Stages => &mut self.stages,
            Scope::Parameters => &mut self.parameters,
            Scope::Env => &mut self.env,
        }
    }
}

impl StepData {
    /// Parse step metadata from a YAML string
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        Self::parse("step metadata", yaml)
    }

    /// Read step metadata from a stream; `document` names it in errors
    pub fn from_reader<R: Read>(document: &str, mut reader: R) -> ConfigResult<Self> {
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .map_err(|e| ConfigError::io(document, e))?;
        Self::parse(document, &content)
    }

    fn parse(document: &str, yaml: &str) -> ConfigResult<Self> {
        let data: StepData =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::parse(document, e))?;
        data.validate(document)?;
        Ok(data)
    }

    fn validate(&self, document: &str) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for param in &self.spec.inputs.params {
            if !seen.insert(param.name.as_str()) {
                return Err(ConfigError::parse(
                    document,
                    format!("duplicate parameter '{}'", param.name),
                ));
            }
        }
        Ok(())
    }

    pub fn parameters(&self) -> &[StepParameter] {
        &self.spec.inputs.params
    }

    /// Distribute each parameter name into the lists of every scope it declares
    pub fn parameter_filters(&self) -> StepFilters {
        let verbose = vec![VERBOSE_PARAMETER.to_string()];
        let mut filters = StepFilters {
            all: verbose.clone(),
            general: verbose.clone(),
            steps: verbose.clone(),
            stages: verbose.clone(),
            parameters: verbose,
            env: Vec::new(),
        };

        for param in self.parameters() {
            let keys = param.filter_keys();
            filters.all.extend(keys.iter().cloned());
            for scope in &param.scope {
                filters.scope_mut(*scope).extend(keys.iter().cloned());
            }
        }
        filters
    }

    /// Names provided by the execution context, allowed in every scope
    pub fn context_parameter_filters(&self) -> StepFilters {
        let mut context: Vec<String> = self
            .spec
            .inputs
            .secrets
            .iter()
            .map(|s| s.name.clone())
            .collect();

        if self
            .spec
            .inputs
            .resources
            .iter()
            .any(|r| r.resource_type == "stash")
        {
            context.push("stashContent".to_string());
        }

        if !self.spec.containers.is_empty() {
            context.extend(CONTAINER_PARAMETERS.iter().map(|s| s.to_string()));
            // the parameter selecting a container and the value it is selected by
            for condition in self.spec.containers.iter().flat_map(|c| &c.conditions) {
                for param in &condition.params {
                    context.push(param.value.clone());
                    context.push(param.name.clone());
                }
            }
        }
        if !self.spec.sidecars.is_empty() {
            context.extend(SIDECAR_PARAMETERS.iter().map(|s| s.to_string()));
        }

        let mut vault = Vec::new();
        if self.has_reference(VAULT_SECRET_REF) {
            context.push("vaultAppRoleTokenCredentialsId".to_string());
            context.push("vaultAppRoleSecretTokenCredentialsId".to_string());
        }
        if self.has_reference(VAULT_SECRET_REF) || self.has_reference(VAULT_SECRET_FILE_REF) {
            vault.extend(VAULT_CONFIG_PARAMETERS.iter().map(|s| s.to_string()));
            vault.extend(
                self.parameters()
                    .iter()
                    .flat_map(|p| {
                        p.reference(VAULT_SECRET_REF)
                            .into_iter()
                            .chain(p.reference(VAULT_SECRET_FILE_REF))
                    })
                    .map(|r| r.name.clone()),
            );
        }

        let configurable: Vec<String> = context.iter().chain(&vault).cloned().collect();
        StepFilters {
            all: configurable.clone(),
            general: configurable.clone(),
            steps: configurable.clone(),
            stages: configurable.clone(),
            parameters: configurable,
            env: context,
        }
    }

    /// Parameter filters merged with the context filters
    pub fn filters(&self) -> StepFilters {
        let mut filters = self.parameter_filters();
        filters.extend(self.context_parameter_filters());
        filters
    }

    /// Whether any parameter carries a resource reference of the given type
    pub fn has_reference(&self, ref_type: &str) -> bool {
        self.parameters()
            .iter()
            .any(|p| p.reference(ref_type).is_some())
    }

    pub fn parameter(&self, name: &str) -> Option<&StepParameter> {
        self.parameters().iter().find(|p| p.name == name)
    }

    /// Seed configuration built from the parameter defaults. A conditional
    /// parameter stores its default under the mapping named by each
    /// condition value instead of at the top level.
    pub fn step_defaults(&self) -> Mapping {
        let mut defaults = Mapping::new();
        for param in self.parameters() {
            let Some(default) = &param.default else {
                continue;
            };
            if param.conditions.is_empty() {
                defaults.insert(param.name.clone(), default.clone());
                continue;
            }
            for condition_param in param.conditions.iter().flat_map(|c| c.params.iter()) {
                let slot = defaults
                    .entry(condition_param.value.clone())
                    .or_insert_with(|| Value::Mapping(Mapping::new()));
                if let Value::Mapping(nested) = slot {
                    nested.insert(param.name.clone(), default.clone());
                }
            }
        }
        defaults
    }
}
