//! TOML configuration. Every key is optional.

use std::{path::Path, time::Duration};

use color_eyre::eyre::{self, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{
    ffs::Environment,
    resource::{ResourceDefinition, ResourceTable},
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub simulation: Environment,
    /// Added to, or replacing entries of, the stock resource table.
    pub resources: Vec<ResourceDefinition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lower bound for the delay between runs.
    pub min_delay_ms: u64,
    /// The next delay is this many times the last run's wall time.
    pub delay_multiplier: f64,
    /// Drop the previous stages when a run fails instead of keeping them.
    pub clear_on_failure: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 50,
            delay_multiplier: 10.0,
            clear_on_failure: false,
        }
    }
}

impl SchedulerConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Could not read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .wrap_err_with(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> eyre::Result<Self> {
        let config: Self = toml::from_str(s)?;
        config
            .simulation
            .validate()
            .wrap_err("Invalid [simulation] section")?;
        Ok(config)
    }

    /// The stock resources with this configuration's additions applied.
    pub fn resource_table(&self) -> ResourceTable {
        let mut table = ResourceTable::stock();
        for def in &self.resources {
            table.insert(def.clone());
        }
        table
    }
}
