//! Core configuration model
//!
//! This module defines the configuration value type, the documents a step
//! configuration is merged from, step metadata and the merger itself.

pub mod config;
pub mod context;
pub mod error;
pub mod interpolation;
pub mod metadata;
pub mod value;

pub use config::*;
pub use context::*;
pub use error::*;
pub use metadata::*;
pub use value::{filter, mapping, merge, Mapping, Value};
