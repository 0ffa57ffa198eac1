//! `$(name)` references inside configuration strings
//!
//! References are looked up in the same flat configuration they appear in.
//! Substitution repeats until no reference is left, at most ten passes.

use crate::core::error::{ConfigError, ConfigResult};
use crate::core::value::{Mapping, Value};
use regex::Regex;
use std::sync::LazyLock;

/// Upper bound on substitution passes before a value counts as cyclic
pub const MAX_INTERPOLATION_PASSES: usize = 10;

static REFERENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\(([a-zA-Z0-9.]*)\)").expect("reference pattern compiles"));

/// Names referenced by `template`, in order of appearance
pub fn references(template: &str) -> Vec<&str> {
    REFERENCE_REGEX
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Whether every reference in `template` names a non-empty string in `lookup`
pub fn is_resolvable(template: &str, lookup: &Mapping) -> bool {
    references(template)
        .into_iter()
        .all(|name| matches!(lookup.get(name), Some(Value::String(s)) if !s.is_empty()))
}

/// Resolve all references in `template`. `key` names the value in errors.
pub fn interpolate(key: &str, template: &str, lookup: &Mapping) -> ConfigResult<String> {
    let mut current = template.to_string();
    for _ in 0..MAX_INTERPOLATION_PASSES {
        if !REFERENCE_REGEX.is_match(&current) {
            return Ok(current);
        }
        current = substitute_once(key, &current, lookup)?;
    }
    if REFERENCE_REGEX.is_match(&current) {
        return Err(ConfigError::InterpolationCycle {
            key: key.to_string(),
            passes: MAX_INTERPOLATION_PASSES,
        });
    }
    Ok(current)
}

fn substitute_once(key: &str, template: &str, lookup: &Mapping) -> ConfigResult<String> {
    let mut result = String::with_capacity(template.len());
    let mut last_end = 0;
    for caps in REFERENCE_REGEX.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        result.push_str(&template[last_end..whole.start()]);
        match lookup.get(name.as_str()) {
            Some(Value::String(s)) => result.push_str(s),
            None | Some(Value::Null) => {}
            Some(other) => {
                return Err(ConfigError::Type {
                    key: format!("{} (referenced from '{}')", name.as_str(), key),
                    expected: "string",
                    found: other.type_name(),
                })
            }
        }
        last_end = whole.end();
    }
    result.push_str(&template[last_end..]);
    Ok(result)
}

/// Interpolate every top-level string value of `config` against itself.
/// Nested values and non-strings are left alone.
pub fn interpolate_mapping(config: &Mapping) -> ConfigResult<Mapping> {
    config
        .iter()
        .map(|(key, value)| -> ConfigResult<(String, Value)> {
            let resolved = match value {
                Value::String(s) => Value::String(interpolate(key, s, config)?),
                other => other.clone(),
            };
            Ok((key.clone(), resolved))
        })
        .collect()
}
