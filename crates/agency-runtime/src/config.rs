//! Runtime configuration loaded from YAML.

use std::path::Path;

use agency_core::{
    validate_policy, validate_scouting, EconomyPolicy, ScoutingPolicy, StarterGrant,
};
use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Settings for an [`crate::Agency`] instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// SQLite URL of the save database.
    pub database_url: String,
    /// Extra attempts after a commit loses an optimistic-concurrency race.
    pub max_commit_retries: u32,
    /// Economy tuning.
    pub policy: EconomyPolicy,
    /// Scouting price and odds.
    pub scouting: ScoutingPolicy,
    /// One-time grant for new players.
    pub starter: StarterGrant,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: persistence::default_sqlite_url().to_string(),
            max_commit_retries: 3,
            policy: EconomyPolicy::default(),
            scouting: ScoutingPolicy::default(),
            starter: StarterGrant::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a YAML document. Missing keys keep their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, RuntimeError> {
        let cfg: RuntimeConfig =
            serde_yaml::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.database_url.trim().is_empty() {
            return Err(RuntimeError::Config("database_url must not be empty".into()));
        }
        validate_policy(&self.policy)?;
        validate_scouting(&self.scouting, &self.starter)?;
        Ok(())
    }
}
