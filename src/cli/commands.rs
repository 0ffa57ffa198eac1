//! CLI command definitions

use crate::core::error::ConfigResult;
use crate::core::metadata::StepData;
use crate::core::value::{Mapping, Value};
use clap::Args;

/// Print the effective configuration of a step
#[derive(Debug, Args, Clone)]
pub struct GetConfigCommand {
    /// Path to the step metadata YAML file
    #[arg(short, long)]
    pub metadata: String,

    /// Stage the step runs in
    #[arg(long, default_value = "")]
    pub stage_name: String,

    /// Step name, defaults to the name in the metadata
    #[arg(long)]
    pub step_name: Option<String>,

    /// Parameters as a JSON object
    #[arg(long, default_value = "")]
    pub param_json: String,

    /// Explicit parameter values (name=value)
    #[arg(long, value_parser = parse_key_value)]
    pub param: Vec<(String, String)>,

    /// Fill secret parameters from the KV store and the trust engine
    #[arg(long)]
    pub resolve_secrets: bool,

    /// Write the configuration here instead of stdout
    #[arg(long)]
    pub output_file: Option<String>,

    /// Write KV credential exports as NAME=value lines to this file
    #[arg(long, requires = "resolve_secrets")]
    pub credentials_env_file: Option<String>,
}

/// Evaluate stage conditions and report whether a step runs
#[derive(Debug, Args, Clone)]
pub struct CheckStepActiveCommand {
    /// Path to the stage condition document or pipeline definition
    #[arg(long)]
    pub stage_config: String,

    /// Step to check
    #[arg(long)]
    pub step: String,

    /// Stage to check the step in; any stage when omitted
    #[arg(long)]
    pub stage: Option<String>,

    /// Step metadata files used to resolve the configuration of their steps
    #[arg(long)]
    pub metadata: Vec<String>,

    /// Directory of the pipeline environment read by pipeline definitions
    #[arg(long, default_value = ".pipeline")]
    pub env_root_path: String,

    /// Write the activation of every stage to this JSON file
    #[arg(long)]
    pub stage_output_file: Option<String>,

    /// Write the activation of every step to this JSON file
    #[arg(long)]
    pub step_output_file: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}

/// Flag values typed by the declared parameter types. Parameters unknown to
/// the metadata stay strings.
pub fn flag_values(metadata: &StepData, params: &[(String, String)]) -> ConfigResult<Mapping> {
    params
        .iter()
        .map(|(name, raw)| -> ConfigResult<(String, Value)> {
            let value = match metadata.parameter(name) {
                Some(param) => param.param_type.coerce(name, raw)?,
                None => raw.as_str().into(),
            };
            Ok((name.clone(), value))
        })
        .collect()
}
