//! Binding configuration
//!
//! Groups the engine context settings and the packet driver settings. Files
//! may be TOML, YAML or JSON; `UTP__<SECTION>__<FIELD>` environment variables
//! override file values.

use std::path::Path;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

// Re-export the section types
pub use crate::transport::{ContextConfig, DriverConfig};

fn environment() -> Environment {
    Environment::with_prefix("UTP")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// Complete uTP binding configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtpConfig {
    /// Engine context settings
    pub context: ContextConfig,
    /// UDP packet driver settings
    pub driver: DriverConfig,
}

impl UtpConfig {
    /// Load from `path`, then apply `UTP__*` environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let loaded: UtpConfig = Config::builder()
            .add_source(File::from(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        debug!("Loaded uTP configuration from {}", path.display());
        Ok(loaded)
    }

    /// Defaults with `UTP__*` environment overrides only
    pub fn from_env() -> Result<Self> {
        let loaded = Config::builder()
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(loaded)
    }
}
