//! Configuration module for pipemesh
//!
//! Settings are read from a TOML file with three sections:
//!
//! ```toml
//! [logging]
//! filter = "info,pipemesh=debug"
//!
//! [daemon]
//! port = 5232
//! output_dir = "/tmp/pipemesh"
//! log_to_file = false
//!
//! [deploy]
//! port = 5232
//! base_port = 6000
//! request_timeout_ms = 1000
//! ```
//!
//! # Location
//!
//! Unless a path is given explicitly, the file is looked up under the
//! platform config directory:
//! - **Linux**: `~/.config/pipemesh/pipemesh.toml`
//! - **macOS**: `~/Library/Application Support/pipemesh/pipemesh.toml`
//! - **Windows**: `%APPDATA%\pipemesh\pipemesh.toml`
//!
//! A missing file is not an error; every field has a default.

use crate::error::{PipemeshError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "pipemesh";

/// Settings filename
pub const SETTINGS_FILE: &str = "pipemesh.toml";

/// Default daemon control port
pub const DEFAULT_DAEMON_PORT: u16 = 5232;

/// First port handed out to network bridges
pub const DEFAULT_BASE_PORT: u16 = 6000;

/// Default timeout for one control request in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Default tracing filter
pub const DEFAULT_LOG_FILTER: &str = "info,pipemesh=debug";

/// Path of the settings file in the platform config directory
pub fn default_settings_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(SETTINGS_FILE))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Job daemon settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub port: u16,

    /// Where job descriptions and their stdout/stderr files are written
    pub output_dir: PathBuf,

    /// Loader executable; the current executable's `load` command when unset
    pub loader_path: Option<PathBuf>,

    /// Write daemon logs to a daily rolling file in `output_dir`
    pub log_to_file: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_DAEMON_PORT,
            output_dir: std::env::temp_dir().join(APP_ID),
            loader_path: None,
            log_to_file: false,
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Daemon port assumed for every host
    pub port: u16,

    pub base_port: u16,

    pub request_timeout_ms: u64,
}

impl DeploySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_DAEMON_PORT,
            base_port: DEFAULT_BASE_PORT,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// All persistent settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub daemon: DaemonSettings,
    pub deploy: DeploySettings,
}

impl Settings {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_settings_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            PipemeshError::Config(format!("Failed to read settings {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse settings {:?}", path))
    }

    /// Load settings, returning defaults on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save settings to `path` as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PipemeshError::Config(format!("Failed to create settings directory: {}", e))
            })?;
        }

        std::fs::write(path, self.to_toml_string()?).map_err(|e| {
            PipemeshError::Config(format!("Failed to write settings {:?}: {}", path, e))
        })
    }
}
