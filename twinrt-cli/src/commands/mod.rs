//! CLI command implementations.

pub mod replay;

pub use replay::{replay_scenario, ReplayOptions};

use anyhow::{Context, Result};
use std::path::Path;
use twinrt_core::RuntimeConfig;

/// Runtime configuration from `path`, or the defaults when none is given
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

pub fn show_config(config: &RuntimeConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}
