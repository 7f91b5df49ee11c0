//! Persistent CLI configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "cli-config.json";

/// Sync account and connectivity settings stored next to the user's other
/// app config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    /// Base URL of the sync server
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Account the records belong to
    #[serde(default)]
    pub user_id: Option<String>,
    /// Bearer token for the sync server
    #[serde(default)]
    pub access_token: Option<String>,
    /// Work offline even when credentials are configured
    #[serde(default)]
    pub offline: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            version: default_config_version(),
            api_base_url: None,
            user_id: None,
            access_token: None,
            offline: false,
        }
    }
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jot")
        .join(CONFIG_FILE_NAME)
}

impl CliConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from_path(&default_config_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, String> {
        let path = default_config_path();
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    error
                )
            })?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)
            .map_err(|error| format!("Failed to serialize config: {error}"))?;
        std::fs::write(path, serialized)
            .map_err(|error| format!("Failed to write config at {}: {}", path.display(), error))
    }

    /// Whether a user id and token are stored
    pub fn is_signed_in(&self) -> bool {
        self.user_id.is_some() && self.access_token.is_some()
    }

    fn normalize(&mut self) {
        self.api_base_url = jot_core::util::normalize_text_option(self.api_base_url.take());
        self.user_id = jot_core::util::normalize_text_option(self.user_id.take());
        self.access_token = jot_core::util::normalize_text_option(self.access_token.take());
    }
}
