//! Configuration for the storage lifecycle core

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pruning::PruningPolicy;
use crate::status::{Result, Status};

/// Tunables for the storage lifecycle core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Maximum concurrently running storage tasks (0 = unbounded)
    #[serde(default = "default_max_coroutines")]
    pub max_coroutines: usize,

    /// Commit pruning policy
    #[serde(default)]
    pub pruning_policy: PruningPolicy,
}

fn default_max_coroutines() -> usize {
    16
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_coroutines: default_max_coroutines(),
            pruning_policy: PruningPolicy::default(),
        }
    }
}

impl LedgerConfig {
    /// Parse a configuration document
    pub fn from_json(raw: &str) -> Result<LedgerConfig> {
        serde_json::from_str(raw).map_err(|err| Status::Internal(format!("invalid config: {err}")))
    }

    /// Load configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<LedgerConfig> {
        let path = path.as_ref();
        debug!(?path, "LedgerConfig::load: called");
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}
