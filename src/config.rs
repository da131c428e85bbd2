//! Configuration
//!
//! Every setting has a default under `~/.claude-trace`. An optional
//! `config.toml` in the data directory overrides them, and
//! `CLAUDE_TRACE_HOME` moves the data directory itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the data directory
pub const HOME_ENV: &str = "CLAUDE_TRACE_HOME";

const CONFIG_FILE: &str = "config.toml";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub otel_dir: Option<PathBuf>,
    pub mapping_file: Option<PathBuf>,
    /// Where Claude Code keeps project transcripts
    pub projects_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// Resource snapshot period of `monitor` and `watch --resources`
    pub resource_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_path: None,
            otel_dir: None,
            mapping_file: None,
            projects_dir: None,
            poll_interval_ms: 1000,
            resource_interval_ms: 500,
        }
    }
}

impl Config {
    /// Load `config.toml` from the default data directory
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_data_dir().join(CONFIG_FILE);
        Self::load_from(&path)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .as_deref()
            .map(|p| expand_tilde(&p.to_string_lossy()))
            .unwrap_or_else(default_data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database_path, "traces.db")
    }

    pub fn otel_dir(&self) -> PathBuf {
        self.resolve(&self.otel_dir, "otel-metrics")
    }

    pub fn mapping_file(&self) -> PathBuf {
        self.resolve(&self.mapping_file, "otel-session-mapping.json")
    }

    pub fn projects_dir(&self) -> PathBuf {
        match &self.projects_dir {
            Some(dir) => expand_tilde(&dir.to_string_lossy()),
            None => home_dir().join(".claude").join("projects"),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn resource_interval(&self) -> Duration {
        Duration::from_millis(self.resource_interval_ms.max(1))
    }

    fn resolve(&self, explicit: &Option<PathBuf>, file_name: &str) -> PathBuf {
        match explicit {
            Some(path) => expand_tilde(&path.to_string_lossy()),
            None => self.data_dir().join(file_name),
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `$CLAUDE_TRACE_HOME`, else `~/.claude-trace`
pub fn default_data_dir() -> PathBuf {
    match std::env::var(HOME_ENV) {
        Ok(dir) if !dir.trim().is_empty() => expand_tilde(&dir),
        _ => home_dir().join(".claude-trace"),
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    if let Some(stripped) = path.strip_prefix("~/") {
        return home_dir().join(stripped);
    }
    PathBuf::from(path)
}
