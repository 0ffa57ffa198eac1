//! Configuration documents and the layered step configuration merger
//!
//! A step configuration is built by mixing sources on top of an empty
//! accumulator, lowest precedence first:
//!
//! 1. parameter defaults from the step metadata
//! 2. default documents, then custom defaults (`general`, then `steps.<step>`)
//! 3. the project config (`general`, `steps.<step>`, `stages.<stage>`)
//! 4. `PIPER_<name>` environment variables
//! 5. parameter JSON
//! 6. explicit flags
//!
//! Each source passes through the scope filter of the place it came from
//! before it is merged in.

use crate::core::context::ResolutionContext;
use crate::core::error::{ConfigError, ConfigResult};
use crate::core::interpolation::interpolate_mapping;
use crate::core::metadata::{StepData, StepFilters, StepParameter};
use crate::core::value::{filter, merge, Mapping, Value};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use tracing::{debug, warn};

/// Opens a named document for reading
pub type OpenFile = dyn Fn(&str) -> io::Result<Box<dyn Read>> + Send + Sync;

/// Open a document from the local filesystem. Remote locations are not supported.
pub fn open_local_file(name: &str) -> io::Result<Box<dyn Read>> {
    if name.starts_with("http") {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("file location not yet supported for '{}'", name),
        ));
    }
    Ok(Box::new(File::open(name)?))
}

/// Prefix of environment variables that override parameters
pub const ENV_PREFIX: &str = "PIPER_";

/// Project configuration or defaults document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Further defaults documents to load after the regular defaults
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "nullable")]
    pub custom_defaults: Vec<String>,

    #[serde(default, deserialize_with = "nullable")]
    pub general: Mapping,

    #[serde(default, deserialize_with = "sections")]
    pub stages: BTreeMap<String, Mapping>,

    #[serde(default, deserialize_with = "sections")]
    pub steps: BTreeMap<String, Mapping>,

    /// Settings for collaborators outside the step, e.g. the trust service
    #[serde(default, skip_serializing_if = "Mapping::is_empty", deserialize_with = "nullable")]
    pub hooks: Mapping,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Section maps drop entries whose value is null
fn sections<'de, D>(deserializer: D) -> Result<BTreeMap<String, Mapping>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Option<Mapping>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, section)| section.map(|s| (name, s)))
        .collect())
}

impl Config {
    /// Parse a configuration document from a YAML string
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        Self::parse("configuration", yaml)
    }

    /// Read a configuration document from a stream; `document` names it in errors
    pub fn from_reader<R: Read>(document: &str, mut reader: R) -> ConfigResult<Self> {
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .map_err(|e| ConfigError::io(document, e))?;
        Self::parse(document, &content)
    }

    fn parse(document: &str, yaml: &str) -> ConfigResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::parse(document, e))
    }

    /// Section of a step, if configured
    pub fn step_section(&self, step_name: &str) -> Option<&Mapping> {
        self.steps.get(step_name)
    }

    /// Section of a stage, if configured
    pub fn stage_section(&self, stage_name: &str) -> Option<&Mapping> {
        self.stages.get(stage_name)
    }
}

/// All documents taking part in a merge
#[derive(Debug, Clone, Default)]
pub struct ConfigDocuments {
    /// Project configuration
    pub config: Config,

    /// Default documents in precedence order, lowest first
    pub defaults: Vec<Config>,

    /// Documents listed under `customDefaults` of the project configuration
    pub custom_defaults: Vec<Config>,
}

impl ConfigDocuments {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_defaults(mut self, defaults: Vec<Config>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_custom_defaults(mut self, custom_defaults: Vec<Config>) -> Self {
        self.custom_defaults = custom_defaults;
        self
    }

    /// Load the project configuration, the default documents and every custom
    /// default the configuration lists. Documents that cannot be opened or
    /// read are treated as absent; documents that do not parse abort loading.
    pub fn load(
        config_path: Option<&str>,
        default_paths: &[String],
        open_file: &OpenFile,
    ) -> ConfigResult<Self> {
        let config = match config_path {
            Some(path) => read_optional(path, open_file)?.unwrap_or_default(),
            None => Config::default(),
        };

        let mut defaults = Vec::new();
        for path in default_paths {
            if let Some(doc) = read_optional(path, open_file)? {
                defaults.push(doc);
            }
        }

        let mut custom_defaults = Vec::new();
        for path in &config.custom_defaults {
            if let Some(doc) = read_optional(path, open_file)? {
                custom_defaults.push(doc);
            }
        }

        debug!(
            "Loaded configuration with {} defaults and {} custom defaults",
            defaults.len(),
            custom_defaults.len()
        );

        Ok(Self {
            config,
            defaults,
            custom_defaults,
        })
    }
}

fn read_optional(name: &str, open_file: &OpenFile) -> ConfigResult<Option<Config>> {
    let reader = match open_file(name) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("Configuration document '{}' not available: {}", name, e);
            return Ok(None);
        }
    };
    match Config::from_reader(name, reader) {
        Ok(doc) => Ok(Some(doc)),
        Err(ConfigError::Io { document, source }) => {
            warn!("Configuration document '{}' not readable: {}", document, source);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Inputs for resolving the configuration of one step
#[derive(Debug, Clone, Default)]
pub struct StepConfigRequest {
    pub stage_name: String,
    pub step_name: String,

    /// Parameter descriptors used for aliases and conditional values
    pub parameters: Vec<StepParameter>,

    /// Scope filters; empty lists allow everything
    pub filters: StepFilters,

    /// Seed values, lowest precedence
    pub step_defaults: Mapping,

    /// Parameters as a JSON object string; malformed input is ignored
    pub param_json: String,

    /// Flags the operator actually set
    pub flags: Mapping,

    pub ignore_custom_defaults: bool,
}

impl StepConfigRequest {
    pub fn new(stage_name: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            step_name: step_name.into(),
            ..Self::default()
        }
    }

    /// Take parameters, filters and defaults from step metadata
    pub fn with_metadata(mut self, metadata: &StepData) -> Self {
        self.parameters = metadata.parameters().to_vec();
        self.filters = metadata.filters();
        self.step_defaults = metadata.step_defaults();
        self
    }

    pub fn with_filters(mut self, filters: StepFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_param_json(mut self, param_json: impl Into<String>) -> Self {
        self.param_json = param_json.into();
        self
    }

    pub fn with_flags(mut self, flags: Mapping) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_ignore_custom_defaults(mut self, ignore: bool) -> Self {
        self.ignore_custom_defaults = ignore;
        self
    }
}

/// Effective configuration of a step
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepConfig {
    /// Parameter name to resolved value
    pub config: Mapping,

    /// Merged `hooks` sections of all documents
    pub hook_config: Mapping,
}

impl StepConfig {
    /// Merge all sources for the requested step
    pub fn resolve(
        documents: &ConfigDocuments,
        request: &StepConfigRequest,
        ctx: &ResolutionContext,
    ) -> ConfigResult<StepConfig> {
        let merger = Merger { request, ctx };
        let filters = &request.filters;

        let mut config = request.step_defaults.clone();
        let mut hook_config = Mapping::new();

        let custom: &[Config] = if request.ignore_custom_defaults {
            &[]
        } else {
            &documents.custom_defaults
        };
        for doc in documents.defaults.iter().chain(custom) {
            let doc = merger.aliased(doc);
            config = mix_in(&config, &doc.general, &filters.general);
            if let Some(section) = doc.step_section(&request.step_name) {
                config = mix_in(&config, section, &filters.steps);
            }
            hook_config = merge(&hook_config, &doc.hooks);
        }

        let project = merger.aliased(&documents.config);
        config = mix_in(&config, &project.general, &filters.general);
        if let Some(section) = project.step_section(&request.step_name) {
            config = mix_in(&config, section, &filters.steps);
        }
        if let Some(section) = project.stage_section(&request.stage_name) {
            config = mix_in(&config, section, &filters.stages);
        }
        hook_config = merge(&hook_config, &project.hooks);

        config = mix_in(&config, &env_values(&filters.all, ctx), &filters.all);

        if let Some(params) = merger.param_json() {
            config = mix_in(&config, &params, &filters.parameters);
        }

        config = mix_in(&config, &request.flags, &filters.parameters);

        apply_conditional_values(&mut config, &request.parameters);

        let config = interpolate_mapping(&config)?;
        Ok(StepConfig {
            config,
            hook_config,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// String value of `key`; `None` when absent or not a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.config.insert(key.into(), value.into());
    }
}

/// `merge(target, filter(source, allow))`
pub fn mix_in(target: &Mapping, source: &Mapping, allow: &[String]) -> Mapping {
    merge(target, &filter(source, allow))
}

fn env_values(names: &[String], ctx: &ResolutionContext) -> Mapping {
    names
        .iter()
        .filter_map(|name| {
            ctx.env
                .get(&format!("{}{}", ENV_PREFIX, name))
                .filter(|value| !value.is_empty())
                .map(|value| (name.clone(), Value::String(value)))
        })
        .collect()
}

/// For a conditional parameter that is still unset and whose dependency
/// currently holds the expected value, take the value from the mapping named
/// by that value, falling back to the parameter default.
fn apply_conditional_values(config: &mut Mapping, parameters: &[StepParameter]) {
    for param in parameters {
        let Some(dependency) = param.dependency() else {
            continue;
        };
        if config.get(&param.name).is_some_and(|v| !v.is_null()) {
            continue;
        }
        let dependent = config.get(&dependency.name).and_then(Value::as_str);
        if dependent != Some(dependency.value.as_str()) {
            continue;
        }
        let nested = config
            .get(&dependency.value)
            .and_then(Value::as_mapping)
            .and_then(|m| m.get(&param.name))
            .filter(|v| !v.is_null())
            .cloned();
        if let Some(value) = nested.or_else(|| param.default.clone()) {
            config.insert(param.name.clone(), value);
        }
    }
}

struct Merger<'a> {
    request: &'a StepConfigRequest,
    ctx: &'a ResolutionContext,
}

impl Merger<'_> {
    /// Copy of the sections relevant to this step with aliases applied
    fn aliased(&self, doc: &Config) -> Config {
        let filters = &self.request.filters;
        let mut doc = Config {
            custom_defaults: Vec::new(),
            general: doc.general.clone(),
            stages: doc
                .stage_section(&self.request.stage_name)
                .map(|s| BTreeMap::from([(self.request.stage_name.clone(), s.clone())]))
                .unwrap_or_default(),
            steps: doc
                .step_section(&self.request.step_name)
                .map(|s| BTreeMap::from([(self.request.step_name.clone(), s.clone())]))
                .unwrap_or_default(),
            hooks: doc.hooks.clone(),
        };
        self.apply_aliases(&mut doc.general, &filters.general);
        if let Some(section) = doc.stages.get_mut(&self.request.stage_name) {
            self.apply_aliases(section, &filters.stages);
        }
        if let Some(section) = doc.steps.get_mut(&self.request.step_name) {
            self.apply_aliases(section, &filters.steps);
        }
        doc
    }

    fn param_json(&self) -> Option<Mapping> {
        let raw = self.request.param_json.trim();
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_str::<serde_json::Value>(raw).map(Value::from) {
            Ok(Value::Mapping(mut params)) => {
                self.apply_aliases(&mut params, &self.request.filters.parameters);
                Some(params)
            }
            Ok(other) => {
                debug!(
                    "Ignoring parameter JSON of type {}, expected an object",
                    other.type_name()
                );
                None
            }
            Err(e) => {
                debug!("Ignoring malformed parameter JSON: {}", e);
                None
            }
        }
    }

    /// Fill unset canonical names from the first alias that carries a value,
    /// then drop the flat alias keys so only canonical names are merged on.
    /// Nested alias paths stay: their parent may be a parameter of its own.
    fn apply_aliases(&self, section: &mut Mapping, allow: &[String]) {
        let mut superseded = Vec::new();
        for param in &self.request.parameters {
            if !allow.is_empty() && !allow.iter().any(|a| a == &param.name) {
                continue;
            }
            if !section.get(&param.name).is_some_and(|v| !v.is_null()) {
                for alias in &param.aliases {
                    let Some(value) = alias_value(section, &alias.name).cloned() else {
                        continue;
                    };
                    if alias.deprecated {
                        self.ctx
                            .note_deprecated_alias(&alias.name, &param.name, &self.request.step_name);
                    }
                    section.insert(param.name.clone(), value);
                    break;
                }
            }
            superseded.extend(
                param
                    .aliases
                    .iter()
                    .filter(|alias| !alias.name.contains('/'))
                    .map(|alias| alias.name.as_str()),
            );
        }
        for alias in superseded {
            if !self.request.parameters.iter().any(|p| p.name == alias) {
                section.remove(alias);
            }
        }
    }
}

/// Value at an alias name; `a/b` walks into nested mappings
fn alias_value<'m>(section: &'m Mapping, alias: &str) -> Option<&'m Value> {
    let mut parts = alias.split('/');
    let first = parts.next()?;
    let mut current = section.get(first)?;
    for part in parts {
        current = current.as_mapping()?.get(part)?;
    }
    (!current.is_null()).then_some(current)
}
