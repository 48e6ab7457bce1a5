//! Configuration management for the Sluice harness
//!
//! This module provides:
//! - A serde/validator schema for every harness knob
//! - Layered loading (defaults, TOML file, `SLUICE_*` environment, overrides)
//! - Cross-field validation with host-aware warnings
//!
//! # Examples
//!
//! ```rust,no_run
//! use sluice_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_override("fleet.pull_threads", 8)
//!     .with_override("topics.suffix_count", 100)
//!     .load()
//!     .expect("Failed to load configuration");
//!
//! println!("Draining {} topics with {} workers", config.topics.suffix_count, config.fleet.pull_threads);
//! ```

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationContext};

use crate::Result;
use std::path::Path;

/// Load configuration from the default search paths and environment.
///
/// # Errors
/// Returns an error if a source cannot be read or the result is invalid.
pub fn load_default() -> Result<HarnessConfig> {
    ConfigLoader::new().load()
}

/// Load configuration from a specific file.
///
/// # Errors
/// Returns an error if the file cannot be read or the result is invalid.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<HarnessConfig> {
    ConfigLoader::load_from_file(path)
}

/// Validate a configuration object.
///
/// # Errors
/// Returns the first violated rule as [`crate::Error::Configuration`].
pub fn validate(config: &HarnessConfig) -> Result<()> {
    ConfigValidator::validate(config)
}
