//! Built-in conditions

use crate::conditions::registry::{ConditionCall, ConditionError, ConditionResult};
use crate::conditions::stage::ParamValue;
use crate::conditions::{step_config_lookup, GlobFn};
use crate::core::config::OpenFile;
use crate::core::value::Value;
use std::path::Path;
use tracing::debug;

pub const CONFIG_EQUALS: &str = "config-equals";
pub const CONFIG_EXISTS: &str = "config-exists";
pub const FILE_EXISTS: &str = "file-exists";
pub const IS_ACTIVE: &str = "is-active";
pub const NPM_SCRIPT_EXISTS: &str = "npm-script-exists";

const PARAM_CONFIG_KEY: &str = "configKey";
const PARAM_CONTAINS: &str = "contains";
const PARAM_STEP_NAME: &str = "stepName";
const PARAM_FILE_PATTERN: &str = "filePattern";
const PARAM_FILE_PATTERN_FROM_CONFIG: &str = "filePatternFromConfig";
const PARAM_ACTIVATION: &str = "activation";
const PARAM_NPM_SCRIPT: &str = "npmScript";

/// Config slot equals `contains`, or is one of its elements
pub fn config_equals(call: &ConditionCall<'_>) -> ConditionResult<bool> {
    call.expect_params(2)?;
    let (key_param, compare_param) = (&call.params[0], &call.params[1]);
    if key_param.name != PARAM_CONFIG_KEY || compare_param.name != PARAM_CONTAINS {
        return Err(call.shape_error(format!(
            "parameters must be '{}' and '{}'",
            PARAM_CONFIG_KEY, PARAM_CONTAINS
        )));
    }
    let key = non_empty_string(call, &key_param.value)?;
    if compare_param.value.is_empty() {
        return Err(call.shape_error(format!("'{}' is empty", PARAM_CONTAINS)));
    }

    let value = match step_config_lookup(call.config, call.step_name, key) {
        None => return Ok(false),
        Some(Value::String(s)) => s.as_str(),
        Some(other) => {
            return Err(call.type_error(format!(
                "config value of '{}' to compare with is not a string but {}",
                key,
                other.type_name()
            )))
        }
    };

    Ok(match &compare_param.value {
        ParamValue::String(expected) => value == expected,
        ParamValue::Array(candidates) => candidates.iter().any(|c| c == value),
    })
}

/// Config slot `configKey` is set, or `steps.<stepName>` is configured
pub fn config_exists(call: &ConditionCall<'_>) -> ConditionResult<bool> {
    call.expect_params(1)?;
    let param = &call.params[0];
    let name = non_empty_string(call, &param.value)?;
    match param.name.as_str() {
        PARAM_CONFIG_KEY => Ok(step_config_lookup(call.config, call.step_name, name).is_some()),
        PARAM_STEP_NAME => Ok(call
            .config
            .get("steps")
            .and_then(Value::as_mapping)
            .and_then(|steps| steps.get(name))
            .is_some_and(|section| section.as_mapping().is_some())),
        other => Err(call.shape_error(format!("unsupported parameter '{}'", other))),
    }
}

/// A literal glob, or the glob stored in a config slot, matches at least one file
pub fn file_exists(call: &ConditionCall<'_>) -> ConditionResult<bool> {
    call.expect_params(1)?;
    let param = &call.params[0];
    let value = non_empty_string(call, &param.value)?;
    let pattern = match param.name.as_str() {
        PARAM_FILE_PATTERN => value,
        PARAM_FILE_PATTERN_FROM_CONFIG => {
            match step_config_lookup(call.config, call.step_name, value) {
                None => return Ok(false),
                Some(Value::String(s)) => s.as_str(),
                Some(other) => {
                    return Err(call.type_error(format!(
                        "config value of '{}' is not a string but {}",
                        value,
                        other.type_name()
                    )))
                }
            }
        }
        other => return Err(call.shape_error(format!("unsupported parameter '{}'", other))),
    };

    let matches = expand(call.glob, pattern)?;
    debug!(
        "Pattern '{}' for step '{}' matched {} file(s)",
        pattern,
        call.step_name,
        matches.len()
    );
    Ok(!matches.is_empty())
}

/// Explicit `true`/`false` activation
pub fn is_active(call: &ConditionCall<'_>) -> ConditionResult<bool> {
    call.expect_params(1)?;
    let param = &call.params[0];
    if param.name != PARAM_ACTIVATION {
        return Err(call.shape_error(format!("unsupported parameter '{}'", param.name)));
    }
    let value = non_empty_string(call, &param.value)?;
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(call.type_error(format!("'{}' is not a boolean", value))),
    }
}

/// Some `package.json` outside `node_modules` declares the script
pub fn npm_script_exists(call: &ConditionCall<'_>) -> ConditionResult<bool> {
    call.expect_params(1)?;
    let param = &call.params[0];
    if param.name != PARAM_NPM_SCRIPT {
        return Err(call.shape_error(format!("unsupported parameter '{}'", param.name)));
    }
    let script = non_empty_string(call, &param.value)?;

    declares_npm_script(script, call.glob, call.open_file, |message| call.type_error(message))
}

/// Paths matching `pattern`
pub(crate) fn expand(glob: &GlobFn, pattern: &str) -> ConditionResult<Vec<String>> {
    glob(pattern).map_err(|source| ConditionError::Glob {
        pattern: pattern.to_string(),
        source,
    })
}

/// Whether some `package.json` outside `node_modules` declares `script`
pub(crate) fn declares_npm_script(
    script: &str,
    glob: &GlobFn,
    open_file: &OpenFile,
    type_error: impl Fn(String) -> ConditionError,
) -> ConditionResult<bool> {
    const PACKAGE_PATTERN: &str = "**/package.json";
    for package in expand(glob, PACKAGE_PATTERN)? {
        let in_node_modules = Path::new(&package)
            .components()
            .any(|c| c.as_os_str() == "node_modules");
        if in_node_modules {
            continue;
        }

        let reader = open_file(&package).map_err(|source| ConditionError::Io {
            path: package.clone(),
            source,
        })?;
        let manifest: serde_json::Value =
            serde_json::from_reader(reader).map_err(|e| ConditionError::Parse {
                document: package.clone(),
                message: e.to_string(),
            })?;
        let Some(scripts) = manifest.get("scripts") else {
            continue;
        };
        let scripts = scripts
            .as_object()
            .ok_or_else(|| type_error(format!("'scripts' of {} is not an object", package)))?;
        if scripts.contains_key(script) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn non_empty_string<'a>(call: &ConditionCall<'_>, value: &'a ParamValue) -> ConditionResult<&'a str> {
    match value {
        ParamValue::String(s) if !s.is_empty() => Ok(s.as_str()),
        ParamValue::String(_) => Err(call.shape_error("empty parameter value")),
        ParamValue::Array(_) => Err(call.shape_error("expected a string parameter, got an array")),
    }
}
