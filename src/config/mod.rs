//! Configuration management for the connector bridge
//!
//! Precedence: environment > TOML file > defaults.

pub mod file;

use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::{Error, Result};

use file::BridgeConfigFile;

/// Default listener port
const DEFAULT_PORT: u16 = 28520;

/// Default Iggy HTTP port
const DEFAULT_IGGY_HTTP_PORT: u16 = 3000;

/// Connector bridge configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub device_server: DeviceServerConfig,
    pub peer: PeerConfig,
    pub timing: TimingConfig,
    /// Observe every observable resource of newly registered endpoints
    pub auto_subscribe: bool,
}

/// Inbound HTTP listener
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Route receiving webhook messages, always starting with `/`
    pub callback_path: String,
    /// Externally reachable base URL
    pub public_url: String,
    /// Shared secret required on inbound webhook calls
    pub callback_secret: Option<String>,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
}

/// Device-management server connection
#[derive(Debug, Clone)]
pub struct DeviceServerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub endpoint_type: Option<String>,
}

/// Peer bus connection
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub stream: String,
    pub topic_prefix: String,
    pub queue_capacity: usize,
    pub poll_interval: Duration,
}

/// Periods, deadlines and retry budgets
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub validation_interval: Duration,
    pub sweep_interval: Duration,
    pub async_timeout: Duration,
    pub registration_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub shutdown_grace: Duration,
}

impl TimingConfig {
    /// Backoff policy for webhook activation
    #[must_use]
    pub const fn registration_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.registration_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }

    /// Backoff policy for peer reconnection (unbounded attempts)
    #[must_use]
    pub const fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns error if the config file cannot be read or a value is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid
    pub fn resolve(fc: BridgeConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match env("BRIDGE_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("BRIDGE_PORT '{raw}': {e}")))?,
            None => fc.server.port.unwrap_or(DEFAULT_PORT),
        };

        let callback_path = env("BRIDGE_CALLBACK_PATH")
            .or(fc.server.callback_path)
            .unwrap_or_else(|| "/notify".to_string());
        let callback_path = if callback_path.starts_with('/') {
            callback_path
        } else {
            format!("/{callback_path}")
        };
        if callback_path == "/health" {
            return Err(Error::Config(
                "callback path conflicts with /health".to_string(),
            ));
        }

        let public_url = env("BRIDGE_PUBLIC_URL")
            .or(fc.server.public_url)
            .unwrap_or_else(|| format!("http://localhost:{port}"));
        url::Url::parse(&public_url)
            .map_err(|e| Error::Config(format!("invalid public URL '{public_url}': {e}")))?;

        let server = ServerConfig {
            port,
            callback_path,
            public_url: public_url.trim_end_matches('/').to_string(),
            callback_secret: env("BRIDGE_CALLBACK_SECRET")
                .or(fc.server.callback_secret)
                .filter(|s| !s.is_empty()),
            max_concurrent_requests: fc.server.max_concurrent_requests.unwrap_or(64).max(1),
            request_timeout: Duration::from_secs(fc.server.request_timeout_secs.unwrap_or(10)),
        };

        let device_server = DeviceServerConfig {
            base_url: env("CONNECTOR_URL")
                .or(fc.device_server.base_url)
                .unwrap_or_else(|| "https://api.connector.mbed.com".to_string()),
            api_key: env("CONNECTOR_API_KEY")
                .or(fc.device_server.api_key)
                .filter(|k| !k.is_empty()),
            endpoint_type: fc.device_server.endpoint_type,
        };

        let peer_base_url = match env("IGGY_HOST") {
            Some(host) => {
                let port = env("IGGY_HTTP_PORT")
                    .and_then(|s| s.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_IGGY_HTTP_PORT);
                format!("http://{host}:{port}")
            }
            None => fc
                .peer
                .base_url
                .unwrap_or_else(|| format!("http://localhost:{DEFAULT_IGGY_HTTP_PORT}")),
        };

        let peer = PeerConfig {
            base_url: peer_base_url,
            username: env("IGGY_USERNAME")
                .or(fc.peer.username)
                .unwrap_or_else(|| "iggy".to_string()),
            password: env("IGGY_PASSWORD")
                .or(fc.peer.password)
                .unwrap_or_else(|| "iggy".to_string()),
            stream: fc
                .peer
                .stream
                .unwrap_or_else(|| "connector-bridge".to_string()),
            topic_prefix: fc
                .peer
                .topic_prefix
                .unwrap_or_else(|| "connector".to_string()),
            queue_capacity: fc.peer.queue_capacity.unwrap_or(1024).max(1),
            poll_interval: Duration::from_millis(fc.peer.poll_interval_ms.unwrap_or(500)),
        };

        let t = fc.timing;
        let timing = TimingConfig {
            validation_interval: Duration::from_secs(t.validation_interval_secs.unwrap_or(60).max(1)),
            sweep_interval: Duration::from_millis(t.sweep_interval_ms.unwrap_or(1000).max(10)),
            async_timeout: Duration::from_secs(t.async_timeout_secs.unwrap_or(30).max(1)),
            registration_attempts: t.registration_attempts.unwrap_or(5).max(1),
            retry_base_delay: Duration::from_millis(t.retry_base_delay_ms.unwrap_or(500)),
            retry_max_delay: Duration::from_millis(t.retry_max_delay_ms.unwrap_or(30_000)),
            shutdown_grace: Duration::from_secs(t.shutdown_grace_secs.unwrap_or(5)),
        };

        Ok(Self {
            server,
            device_server,
            peer,
            timing,
            auto_subscribe: fc.bridge.auto_subscribe.unwrap_or(false),
        })
    }

    /// Callback URL registered with the device server
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("{}{}", self.server.public_url, self.server.callback_path)
    }

    /// API key, required for anything that talks to the device server
    ///
    /// # Errors
    ///
    /// Returns `Config` error if no key is configured
    pub fn require_api_key(&self) -> Result<&str> {
        self.device_server.api_key.as_deref().ok_or_else(|| {
            Error::Config(
                "device server API key missing (set CONNECTOR_API_KEY or device_server.api_key)"
                    .to_string(),
            )
        })
    }
}
