//! # Configuration
//!
//! Handles loading, parsing, and validation of TOML configuration files.
//! Searches multiple standard locations with a well-defined priority order,
//! then validates all settings before returning. A missing config file is
//! not an error: every setting has a default, and the CLI flags override
//! whatever was loaded.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{env, fs};

/// Server and repository settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Repository root directory.
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,

    /// Address the RPC server binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Per-connection socket read timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_path: default_repo_path(),
            listen: default_listen(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}
fn default_listen() -> String {
    "127.0.0.1:10001".to_string()
}
fn default_read_timeout() -> u64 {
    300
}

/// Standard configuration file search paths, in descending priority order.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/snapvault.toml")];
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/snapvault.toml")));
    }
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/snapvault.toml")));
    }
    paths.push(PathBuf::from("snapvault.toml"));
    paths
}

/// Loads configuration: an explicit path must exist; otherwise the search
/// path is consulted and defaults apply when nothing is found.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config_from(path);
    }
    for path in config_search_paths() {
        if path.exists() {
            return load_config_from(&path);
        }
    }
    Ok(Config::default())
}

/// Loads and validates configuration from a specific file path.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates configuration invariants after parsing.
fn validate_config(config: &Config) -> Result<()> {
    if config.listen.parse::<SocketAddr>().is_err() {
        return Err(anyhow::anyhow!("invalid listen address: {}", config.listen).into());
    }
    if config.read_timeout_secs == 0 {
        return Err(anyhow::anyhow!("read_timeout_secs must be greater than 0").into());
    }
    Ok(())
}
