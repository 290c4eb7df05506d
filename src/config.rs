use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub modem: ModemConfig,

    #[serde(default)]
    pub http: HTTPConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub auth: AuthConfig
}

impl AppConfig {
    /// Load the TOML config (optional unless a path was given explicitly),
    /// then overlay the deployment environment variables.
    pub fn load(config_filepath: Option<PathBuf>) -> Result<Self> {
        let mut config = match config_filepath {
            Some(path) => {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse TOML config file: {:?}", path))?
            },
            None => {
                let default_path = PathBuf::from("config.toml");
                if default_path.exists() {
                    let content = fs::read_to_string(&default_path)
                        .context("Failed to read config.toml")?;
                    toml::from_str(&content).context("Failed to parse config.toml")?
                } else {
                    AppConfig::default()
                }
            }
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("MODEM_BASE_URL") {
            self.modem.base_url = value;
        }
        if let Ok(value) = env::var("MODEM_POLL_INTERVAL") {
            self.modem.poll_interval_ms = value.parse()
                .context("MODEM_POLL_INTERVAL must be milliseconds")?;
        }
        if let Ok(value) = env::var("MODEM_HEALTH_CHECK_INTERVAL") {
            self.modem.health_check_interval_ms = value.parse()
                .context("MODEM_HEALTH_CHECK_INTERVAL must be milliseconds")?;
        }
        if let Ok(value) = env::var("DEFAULT_RATE_LIMIT") {
            self.auth.default_rate_limit = value.parse()
                .context("DEFAULT_RATE_LIMIT must be a positive integer")?;
        }
        if let Ok(value) = env::var("SMS_SEND_CONCURRENCY") {
            self.queue.send_concurrency = value.parse()
                .context("SMS_SEND_CONCURRENCY must be a positive integer")?;
        }
        if let Ok(value) = env::var("SMS_SEND_RATE_LIMIT") {
            self.queue.send_rate_limit = value.parse()
                .context("SMS_SEND_RATE_LIMIT must be a positive integer")?;
        }
        if let Ok(value) = env::var("DATABASE_URL") {
            self.database.database_url = value;
        }
        if let Ok(value) = env::var("HTTP_ADDRESS") {
            self.http.address = value.parse()
                .context("HTTP_ADDRESS must be a socket address like 127.0.0.1:3000")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    #[serde(default = "default_modem_base_url")]
    pub base_url: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64
}
impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            base_url: default_modem_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HTTPConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,

    #[serde(default = "default_http_address")]
    pub address: SocketAddr
}
impl Default for HTTPConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            address: default_http_address()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Simultaneous send executions; the modem tolerates few.
    #[serde(default = "default_send_concurrency")]
    pub send_concurrency: usize,

    /// Sends started per rolling 60 seconds, the hardware limit.
    #[serde(default = "default_send_rate_limit")]
    pub send_rate_limit: u32
}
impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            send_concurrency: default_send_concurrency(),
            send_rate_limit: default_send_rate_limit()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Hourly quota for keys without their own rate_limit.
    #[serde(default = "default_rate_limit")]
    pub default_rate_limit: u32
}
impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_rate_limit: default_rate_limit()
        }
    }
}

fn default_database_url() -> String { "sms-gateway.db".to_string() }
fn default_modem_base_url() -> String { "http://192.168.8.1".to_string() }
fn default_poll_interval_ms() -> u64 { 30_000 }
fn default_health_check_interval_ms() -> u64 { 60_000 }
fn default_http_enabled() -> bool { true }
fn default_http_address() -> SocketAddr { SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 3000) }
fn default_send_concurrency() -> usize { 6 }
fn default_send_rate_limit() -> u32 { 6 }
fn default_rate_limit() -> u32 { 100 }
