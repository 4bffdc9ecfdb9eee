//! Persistent application configuration
//!
//! Stores the probe, processor and simulation settings in a JSON file at
//! `<config_dir>/aecsync/config.json`. Keys follow the kebab-case option names
//! of the core types.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use aecsync_core::{ProbeSettings, ProcessorConfig};

use crate::simulate::SimulationConfig;

fn default_processor() -> ProcessorConfig {
    ProcessorConfig {
        echo_cancel: true,
        ..Default::default()
    }
}

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    /// Far-end probe settings
    #[serde(default)]
    pub probe: ProbeSettings,
    /// Near-end processor settings (echo cancellation on by default)
    #[serde(default = "default_processor")]
    pub processor: ProcessorConfig,
    /// Loopback simulation room
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            probe: ProbeSettings::default(),
            processor: default_processor(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Config file path: `<config_dir>/aecsync/config.json`
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aecsync")
            .join("config.json")
    }

    /// Load config from the default path, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Check every section, and that the processor acquires the configured probe
    pub fn validate(&self) -> Result<()> {
        self.processor.validate()?;
        self.simulation.validate()?;
        if self.processor.echo_cancel && self.processor.probe_name != self.probe.name {
            bail!(
                "processor probe-name '{}' does not match probe name '{}'",
                self.processor.probe_name,
                self.probe.name
            );
        }
        Ok(())
    }
}
