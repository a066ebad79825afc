//! Application configuration.
//!
//! Settings are stored in TOML at `~/.config/binsim/config.toml` (or XDG
//! equivalent). Precedence is defaults, then the config file, then CLI flags
//! and their environment fallbacks, which clap applies on top.
//!
//! # Example Configuration
//!
//! ```toml
//! corpus_path = "/var/lib/binsim/corpus.json"
//! diff_tool = "/opt/bindiff/bin/bindiff"
//! workers = 4
//! job_timeout_secs = 300
//! retries = 2
//! max_input_bytes = 52428800
//! min_similarity = 0.5
//! families = ["APT29", "Lazarus"]
//! ```

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Resolved application configuration after all layers are merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Corpus description file. Required for search and batch runs.
    pub corpus_path: Option<PathBuf>,

    /// Explicit diff tool path. When unset the tool is looked up on PATH,
    /// falling back to the in-process hash engine.
    pub diff_tool: Option<PathBuf>,

    /// Worker pool size for batch runs.
    pub workers: usize,

    /// Per-job deadline in seconds.
    pub job_timeout_secs: u64,

    /// Retry budget for transient engine failures.
    pub retries: u32,

    /// Inputs larger than this are excluded during discovery.
    pub max_input_bytes: u64,

    /// Default similarity floor applied when filtering results.
    pub min_similarity: Option<f64>,

    /// Default family allowlist applied when filtering results.
    pub families: Vec<String>,

    /// Default requested result count.
    pub top_k: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            corpus_path: None,
            diff_tool: None,
            workers: crate::batch::DEFAULT_WORKERS,
            job_timeout_secs: crate::batch::DEFAULT_JOB_TIMEOUT.as_secs(),
            retries: crate::batch::DEFAULT_RETRIES,
            max_input_bytes: 50 * 1024 * 1024,
            min_similarity: None,
            families: Vec::new(),
            top_k: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Returns defaults if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Get the default configuration file path.
    ///
    /// Uses XDG conventions:
    /// - Primary: `$XDG_CONFIG_HOME/binsim/config.toml`
    /// - Fallback: platform-specific config dir
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config)
                .join("binsim")
                .join("config.toml"));
        }

        ProjectDirs::from("", "", "binsim")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Validation(
                "workers must be at least 1".into(),
            ));
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "job_timeout_secs must be at least 1".into(),
            ));
        }
        if let Some(floor) = self.min_similarity {
            if !(0.0..=1.0).contains(&floor) {
                return Err(ConfigError::Validation(format!(
                    "min_similarity must be within [0, 1], got {floor}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.job_timeout_secs, 300);
        assert_eq!(config.retries, 2);
        assert!(config.corpus_path.is_none());
    }

    #[test]
    fn partial_file_merges_onto_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "corpus_path = \"/data/corpus.json\"\nworkers = 8\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(
            config.corpus_path.as_deref(),
            Some(Path::new("/data/corpus.json"))
        );
        assert_eq!(config.workers, 8);
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn similarity_floor_out_of_range_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "min_similarity = 1.5\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workers = [not toml").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
