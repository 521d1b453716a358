//! Generation settings, loaded from an optional TOML file.
//!
//! ```toml
//! model = "llama3"
//! api_url = "http://localhost:11434"
//! system_prompt = "You are terse."
//! temperature = 0.8
//! max_output_tokens = 1024
//! history_length = 10
//! ```
//!
//! Every key is optional. Command-line flags override the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings consumed by the orchestrator and the API client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Model id sent with every request. Empty means none selected.
    pub model: String,
    /// Base address of the model server.
    pub api_url: String,
    /// Prepended to outbound history when non-empty. Never stored in the tree.
    pub system_prompt: String,
    pub temperature: f32,
    /// Output token cap; zero or negative means unlimited.
    pub max_output_tokens: i64,
    /// Number of most recent messages sent as context; zero sends all.
    pub history_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "llama3".to_string(),
            api_url: "http://localhost:11434".to_string(),
            system_prompt: String::new(),
            temperature: 0.8,
            max_output_tokens: 1024,
            history_length: 10,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist. A missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let settings = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `num_predict` as the model server expects it: `-1` for unlimited.
    pub const fn num_predict(&self) -> i64 {
        if self.max_output_tokens > 0 {
            self.max_output_tokens
        } else {
            -1
        }
    }

    pub fn has_model(&self) -> bool {
        !self.model.trim().is_empty()
    }
}

/// `<config dir>/forkchat/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("forkchat").join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.model, "llama3");
        assert_eq!(settings.api_url, "http://localhost:11434");
        assert!(settings.system_prompt.is_empty());
        assert!((settings.temperature - 0.8).abs() < f32::EPSILON);
        assert_eq!(settings.max_output_tokens, 1024);
        assert_eq!(settings.history_length, 10);
    }

    #[test]
    fn missing_keys_take_defaults() {
        let settings = Settings::from_toml("model = \"mistral\"\nhistory_length = 0\n").unwrap();
        assert_eq!(settings.model, "mistral");
        assert_eq!(settings.history_length, 0);
        assert_eq!(settings.api_url, Settings::default().api_url);
    }

    #[test]
    fn non_positive_max_tokens_is_unlimited() {
        let mut settings = Settings::default();
        assert_eq!(settings.num_predict(), 1024);
        settings.max_output_tokens = 0;
        assert_eq!(settings.num_predict(), -1);
        settings.max_output_tokens = -5;
        assert_eq!(settings.num_predict(), -1);
    }

    #[test]
    fn loads_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "system_prompt = \"Be brief.\"\ntemperature = 0.2\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.system_prompt, "Be brief.");
        assert!((settings.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = Settings::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "temperature = \"hot\"\n").unwrap();
        assert!(matches!(Settings::load(Some(&path)), Err(ConfigError::Parse { .. })));
    }
}
