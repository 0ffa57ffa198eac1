//! Scenario tests for configuration resolution, stage conditions and secrets

#[path = "../helpers.rs"]
mod helpers;

mod conditions;
mod interpolation;
mod pipeline;
mod precedence;
