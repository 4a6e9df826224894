use serde::Deserialize;
use std::{fs, time::Duration as StdDuration};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind_addr: String,
    #[serde(default)]
    pub device_auth_token: Option<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub channel_capacity: usize,
    pub cache_capacity: usize,
    pub publish_max_retries: u32,
    pub publish_retry_backoff_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            cache_capacity: 4096,
            publish_max_retries: 3,
            publish_retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    pub staleness_threshold_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: 15_000,
            tick_interval_ms: 2_000,
        }
    }
}

impl LivenessConfig {
    pub fn staleness_threshold(&self) -> time::Duration {
        time::Duration::milliseconds(i64::try_from(self.staleness_threshold_ms).unwrap_or(i64::MAX))
    }

    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetConfig {
    pub session_ttl_hours: i64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self { session_ttl_hours: 24 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtaConfig {
    pub firmware_dir: String,
    pub public_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Without a database the service runs on the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub http: HttpConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub reset: ResetConfig,
    pub ota: OtaConfig,
    pub metrics: Option<MetricsConfig>,
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("RELAY_CONFIG").unwrap_or_else(|_| "relay-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.reset.session_ttl_hours <= 0 {
            anyhow::bail!("reset.session_ttl_hours must be positive");
        }
        if cfg.relay.channel_capacity == 0 {
            anyhow::bail!("relay.channel_capacity must be positive");
        }
        Ok(cfg)
    }
}
