//! Stage condition document
//!
//! ```yaml
//! stages:
//!   Build:
//!     stepConditions:
//!       mavenBuild:
//!         conditions:
//!           - conditionRef: file-exists
//!             params:
//!               - name: filePattern
//!                 value: "**/pom.xml"
//! ```
//!
//! Stage and step order is kept as written. Keys this reader does not know
//! are ignored.

use crate::conditions::registry::{ConditionError, ConditionResult};
use crate::core::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::io::Read;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub stages: IndexMap<String, StageConditions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConditions {
    #[serde(default)]
    pub step_conditions: IndexMap<String, PipelineConditions>,
}

/// Conditions of one step, evaluated in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConditions {
    #[serde(default)]
    pub conditions: Vec<PipelineTaskCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTaskCondition {
    #[serde(default)]
    pub condition_ref: String,

    #[serde(default)]
    pub params: Vec<ConditionParam>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionParam {
    pub name: String,
    pub value: ParamValue,
}

/// A condition parameter value: a single string or a list of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Array(Vec<String>),
}

impl ParamValue {
    /// The string form; `None` for arrays
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            ParamValue::Array(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&[String]> {
        match self {
            ParamValue::Array(items) => Some(items),
            ParamValue::String(_) => None,
        }
    }

    /// Whether the value carries nothing to compare against
    pub fn is_empty(&self) -> bool {
        match self {
            ParamValue::String(s) => s.is_empty(),
            ParamValue::Array(_) => false,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::String(s.to_string())
    }
}

impl From<Vec<&str>> for ParamValue {
    fn from(items: Vec<&str>) -> Self {
        ParamValue::Array(items.into_iter().map(String::from).collect())
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // YAML writers often leave `true` or `3` unquoted
        match Value::deserialize(deserializer)? {
            Value::Sequence(items) => items
                .iter()
                .map(|item| {
                    item.to_scalar_string().ok_or_else(|| {
                        serde::de::Error::custom(format!(
                            "array items must be scalars, found {}",
                            item.type_name()
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ParamValue::Array),
            Value::Null => Ok(ParamValue::String(String::new())),
            other => other.to_scalar_string().map(ParamValue::String).ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "expected string or array, found {}",
                    other.type_name()
                ))
            }),
        }
    }
}

impl ConditionParam {
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl PipelineTaskCondition {
    pub fn new(condition_ref: impl Into<String>, params: Vec<ConditionParam>) -> Self {
        Self {
            condition_ref: condition_ref.into(),
            params,
        }
    }
}

impl StageConfig {
    /// Parse a stage condition document from a YAML string
    pub fn from_yaml(yaml: &str) -> ConditionResult<Self> {
        Self::parse("stage configuration", yaml)
    }

    /// Read a stage condition document from a stream; `document` names it in errors
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
            return Ok(StageConfig::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConditionError::Parse {
            document: document.to_string(),
            message: e.to_string(),
        })
    }

    /// Number of (stage, step) pairs carrying conditions
    pub fn step_count(&self) -> usize {
        self.stages
            .values()
            .map(|stage| stage.step_conditions.len())
            .sum()
    }
}
