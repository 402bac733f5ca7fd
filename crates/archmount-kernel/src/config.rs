//! Orchestrator configuration.
//!
//! Loaded from `config.toml` under the platform config directory
//! (`~/.config/archmount/config.toml` on Linux) or an explicit path:
//!
//! ```toml
//! retention = "durable"        # or "ephemeral": never write recovery records
//! opened_files_limit = 1
//! archive_extension = "zip"
//! state_path = "/var/lib/archmount/state.db"
//!
//! [engine]
//! command = "archmount-codec"
//! args = ["--stdio"]
//! env = { ARCHMOUNT_CODEC_THREADS = "4" }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::ConfigError;

/// Whether recovery records may be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Retention {
    /// Volumes survive restarts through persisted records.
    #[default]
    Durable,
    /// Incognito-equivalent: saving is a no-op.
    Ephemeral,
}

/// How to start the codec engine subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retention: Retention,
    /// Open-file limit each volume is registered with on the host.
    pub opened_files_limit: u32,
    /// SQLite state database; `None` means the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
    /// Extension used for archives produced by pack jobs.
    pub archive_extension: String,
    pub engine: EngineConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retention: Retention::Durable,
            opened_files_limit: 1,
            state_path: None,
            archive_extension: "zip".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// `<config dir>/archmount/config.toml`, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("archmount").join("config.toml"))
    }

    /// Resolved location of the state database.
    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("archmount")
                .join("state.db")
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load from an explicit path. The file must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_opened_files_limit(mut self, limit: u32) -> Self {
        self.opened_files_limit = limit;
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.opened_files_limit, 1);
        assert_eq!(config.retention, Retention::Durable);
    }

    #[test]
    fn parses_engine_table() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            retention = "ephemeral"
            archive_extension = "7z"

            [engine]
            command = "codec"
            args = ["--stdio"]
            "#,
        )
        .unwrap();
        assert_eq!(config.retention, Retention::Ephemeral);
        assert_eq!(config.archive_extension, "7z");
        assert_eq!(config.engine.command, "codec");
        assert_eq!(config.engine.args, vec!["--stdio".to_string()]);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = OrchestratorConfig::load(Path::new("/nonexistent/archmount.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
