//! TOML configuration file loading
//!
//! Supports `~/.config/connector-bridge/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct BridgeConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub device_server: DeviceServerFileConfig,

    #[serde(default)]
    pub peer: PeerFileConfig,

    #[serde(default)]
    pub timing: TimingFileConfig,

    #[serde(default)]
    pub bridge: BridgeFileConfig,
}

/// Inbound HTTP listener
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,
    /// Route the device server posts webhook messages to
    pub callback_path: Option<String>,
    /// Externally reachable base URL (e.g. behind a tunnel or proxy)
    pub public_url: Option<String>,
    pub callback_secret: Option<String>,
    pub max_concurrent_requests: Option<usize>,
    pub request_timeout_secs: Option<u64>,
}

/// Device-management server
#[derive(Debug, Default, Deserialize)]
pub struct DeviceServerFileConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Only discover endpoints of this type at startup
    pub endpoint_type: Option<String>,
}

/// Peer message bus
#[derive(Debug, Default, Deserialize)]
pub struct PeerFileConfig {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub stream: Option<String>,
    pub topic_prefix: Option<String>,
    pub queue_capacity: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

/// Periods, deadlines and retry budgets
#[derive(Debug, Default, Deserialize)]
pub struct TimingFileConfig {
    pub validation_interval_secs: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub async_timeout_secs: Option<u64>,
    pub registration_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

/// Bridge behaviour toggles
#[derive(Debug, Default, Deserialize)]
pub struct BridgeFileConfig {
    pub auto_subscribe: Option<bool>,
}

/// Load the config file from `path`, or from the standard path when `None`
///
/// A missing file yields defaults. An explicitly named file must exist.
///
/// # Errors
///
/// Returns error if an explicit file is missing, or any file cannot be read
/// or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<BridgeConfigFile> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match config_file_path() {
            Some(p) => (p, false),
            None => return Ok(BridgeConfigFile::default()),
        },
    };

    if !explicit && !path.exists() {
        return Ok(BridgeConfigFile::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: BridgeConfigFile = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/connector-bridge/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("connector-bridge").join("config.toml"))
}
