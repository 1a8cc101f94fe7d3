//! TOML-backed configuration, trimmed to what this demo actually needs. The
//! library itself
//! has no notion of this — `dobbin::database::DatabaseOptions` is the only
//! configuration surface the core exposes, and it's explicit, not global.

use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    pub db_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad { db_path: None, log_level: None }
    }
}

impl ConfigLoad {
    /// Loads `dobbin-cli`'s config from the platform config directory under
    /// the given qualifier/app pair, falling back to defaults if absent.
    pub fn load() -> anyhow::Result<Self> {
        Ok(confy::load("dobbin-cli", "config")?)
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        Ok(confy::load_path(path)?)
    }
}
