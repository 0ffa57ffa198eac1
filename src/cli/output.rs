//! CLI output formatting
//!
//! Human-readable lines go to stderr next to the log; stdout only carries
//! JSON.

use crate::conditions::{Deactivation, RunConfig};
use crate::secrets::{ResolvedSecret, SecretSource};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static KEY: Emoji<'_, '_> = Emoji("🔑 ", "* ");

/// Format the activation of one step
pub fn format_step_activation(stage: &str, step: &str, active: bool, reason: Option<&Deactivation>) -> String {
    let location = format!("{} / {}", style(stage).dim(), style(step).bold());
    if active {
        return format!("{} {} {}", CHECK, location, style("active").green());
    }
    let why = match reason {
        Some(Deactivation::Explicit) => "deactivated in configuration".to_string(),
        Some(Deactivation::Condition { condition_ref }) => {
            format!("condition {} not met", style(condition_ref).cyan())
        }
        Some(Deactivation::NoConditionMet) => "no activation condition met".to_string(),
        Some(Deactivation::NotActiveCondition { condition }) => {
            format!("not-active condition {} met", style(condition).cyan())
        }
        None => "inactive".to_string(),
    };
    format!("{} {} {} ({})", CROSS, location, style("inactive").red(), why)
}

/// One line per step of the evaluation, in document order
pub fn format_run_summary(run: &RunConfig) -> Vec<String> {
    run.run_steps
        .iter()
        .flat_map(|(stage, steps)| {
            steps.iter().map(move |(step, active)| {
                format_step_activation(stage, step, *active, run.deactivation_reason(stage, step))
            })
        })
        .collect()
}

/// Format an adopted secret without its value
pub fn format_resolved_secret(secret: &ResolvedSecret) -> String {
    let source = match &secret.source {
        SecretSource::Kv { path } => format!("KV path {}", style(path).dim()),
        SecretSource::KvFile { path, file } => format!(
            "KV path {} into {}",
            style(path).dim(),
            style(file.display()).dim()
        ),
        SecretSource::TrustEngine { system } => format!("trust engine system {}", style(system).dim()),
    };
    format!("{} {} from {}", KEY, style(&secret.parameter).cyan(), source)
}
