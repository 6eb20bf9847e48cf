use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_FALLBACK_URL, SERVICE_TYPE};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub advertise: Option<AdvertiseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Restrict multicast to one interface; all interfaces when unset
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_fallback_url")]
    pub fallback_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_discovery_wait")]
    pub discovery_wait_secs: u64,
    /// Delay between attempts inside the network thread
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Delay between `connect()` attempts inside `reconnect()`
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    #[serde(default = "default_shutdown_join_timeout")]
    pub shutdown_join_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub background_discovery: bool,
    #[serde(default = "default_background_discovery")]
    pub background_discovery_secs: u64,
    /// 0 disables the status loop
    #[serde(default)]
    pub status_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvertiseConfig {
    /// Instance label; "vortideck-<hostname>" when unset
    pub instance: Option<String>,
    pub address: String,
    #[serde(default = "default_advertise_port")]
    pub port: u16,
}

fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}

fn default_discovery_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    100
}

fn default_fallback_url() -> String {
    DEFAULT_FALLBACK_URL.to_string()
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_discovery_wait() -> u64 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_reconnect_delay() -> u64 {
    2
}

fn default_failure_threshold() -> u32 {
    10
}

fn default_join_timeout() -> u64 {
    5
}

fn default_shutdown_join_timeout() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_background_discovery() -> u64 {
    30
}

fn default_advertise_port() -> u16 {
    9001
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            timeout_secs: default_discovery_timeout(),
            tls: false,
            poll_interval_ms: default_poll_interval(),
            interface: None,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fallback_url: default_fallback_url(),
            connect_timeout_secs: default_connect_timeout(),
            discovery_wait_secs: default_discovery_wait(),
            retry_delay_ms: default_retry_delay(),
            reconnect_delay_secs: default_reconnect_delay(),
            failure_threshold: default_failure_threshold(),
            join_timeout_secs: default_join_timeout(),
            shutdown_join_timeout_secs: default_shutdown_join_timeout(),
            background_discovery: true,
            background_discovery_secs: default_background_discovery(),
            status_interval_ms: 0,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Poll slice, capped so stop requests are seen within 500ms
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(1, 500))
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn discovery_wait(&self) -> Duration {
        Duration::from_secs(self.discovery_wait_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn shutdown_join_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_join_timeout_secs)
    }

    pub fn background_discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.background_discovery_secs)
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_ms > 0).then(|| Duration::from_millis(self.status_interval_ms))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Like `load`, but a missing file yields the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Invalid TOML")?;
        Ok(config)
    }
}
