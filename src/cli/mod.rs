//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{CheckStepActiveCommand, GetConfigCommand};
use std::ffi::OsString;

/// Step configuration resolver for CI/CD pipelines
#[derive(Debug, Parser, Clone)]
#[command(name = "stepconf")]
#[command(author = "stepconf contributors")]
#[command(version = "0.1.0")]
#[command(about = "Resolves step configuration and stage conditions of a CI/CD pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the project configuration file
    #[arg(short, long, global = true, default_value = ".pipeline/config.yml")]
    pub config: String,

    /// Default configuration documents, applied in the given order
    #[arg(long = "defaults-config", global = true)]
    pub defaults: Vec<String>,

    /// Skip the custom defaults listed in the project configuration
    #[arg(long, global = true)]
    pub ignore_custom_defaults: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the effective configuration of a step
    GetConfig(GetConfigCommand),

    /// Evaluate stage conditions and report whether a step runs
    CheckStepActive(CheckStepActiveCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
