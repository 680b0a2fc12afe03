use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Optional settings file, loaded from TOML. Every key can also be given on
/// the command line, which wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote-login command template (`{host}` is substituted).
    pub ssh: Option<String>,
    /// Remote user, prepended as `user@host`.
    pub user: Option<String>,
    /// Regex recognising the remote prompt instead of the injected marker.
    pub prompt_regex: Option<String>,
    /// Transcript log opened at startup.
    pub log_file: Option<PathBuf>,
    /// Colour the name prefixes.
    pub color: Option<bool>,
    /// Start with debug tracing on.
    pub debug: Option<bool>,
    /// Abort when a session dies before it ever became ready.
    pub abort_errors: Option<bool>,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// `$XDG_CONFIG_HOME/hostmux/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hostmux").join("config.toml"))
    }

    /// Load `explicit` if given (it must exist), else the default file if
    /// there is one, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path)?.ok_or_else(|| ConfigError::NotFound(path.to_path_buf()));
        }
        match Self::default_path() {
            Some(path) => Ok(Self::load(&path)?.unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    NotFound(PathBuf),
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "Config file {} does not exist", path.display()),
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
