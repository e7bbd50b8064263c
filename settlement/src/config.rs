//! Configuration for the settlement engine

use serde::Deserialize;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default network provider
pub const DEFAULT_PROVIDER_URL: &str = "wss://mainnet.infura.io/ws";

/// Default ledger store
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Settlement engine configuration
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hex private key that signs outbound transfers (required)
    pub private_key: String,

    /// Network provider endpoint
    pub provider_url: String,

    /// Ledger store endpoint
    pub redis_url: String,

    /// Smallest balance worth settling, in ledger units
    pub min_settlement_amount: u64,

    /// Milliseconds between sweeps
    pub poll_interval_ms: u64,

    /// Decimal exponent of ledger units relative to one ETH (9 = gwei)
    pub asset_scale: u8,

    /// Accounts examined per scan call
    pub scan_batch_size: u32,

    /// Upper bound on waiting for a transfer receipt, 0 to wait forever
    pub send_timeout_secs: u64,

    /// Time given to in-flight settlements on shutdown
    pub shutdown_grace_secs: u64,

    /// Age after which an open reservation found at startup is escalated
    pub reservation_safety_margin_secs: u64,

    /// Milliseconds between polls for new blocks
    pub block_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            provider_url: DEFAULT_PROVIDER_URL.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            min_settlement_amount: 1_000_000,
            poll_interval_ms: 60_000,
            asset_scale: 9,
            scan_batch_size: 100,
            send_timeout_secs: 300, // 5 minutes
            shutdown_grace_secs: 30,
            reservation_safety_margin_secs: 600, // 10 minutes
            block_poll_interval_ms: 12_000,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("private_key", &"<redacted>")
            .field("provider_url", &self.provider_url)
            .field("redis_url", &self.redis_url)
            .field("min_settlement_amount", &self.min_settlement_amount)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("asset_scale", &self.asset_scale)
            .field("scan_batch_size", &self.scan_batch_size)
            .field("send_timeout_secs", &self.send_timeout_secs)
            .field("shutdown_grace_secs", &self.shutdown_grace_secs)
            .field(
                "reservation_safety_margin_secs",
                &self.reservation_safety_margin_secs,
            )
            .field("block_poll_interval_ms", &self.block_poll_interval_ms)
            .finish()
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables (and `.env` if present)
    pub fn from_env() -> crate::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Config::default();

        if let Ok(key) = env::var("ETH_SETTLEMENT_PRIVATE_KEY") {
            config.private_key = key;
        }
        if let Ok(url) = env::var("ETH_SETTLEMENT_PROVIDER") {
            config.provider_url = url;
        }
        if let Ok(url) = env::var("ETH_SETTLEMENT_REDIS_URL") {
            config.redis_url = url;
        }
        parse_env("ETH_SETTLEMENT_MIN_AMOUNT", &mut config.min_settlement_amount)?;
        parse_env("ETH_SETTLEMENT_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        parse_env("ETH_SETTLEMENT_ASSET_SCALE", &mut config.asset_scale)?;
        parse_env("ETH_SETTLEMENT_SCAN_BATCH", &mut config.scan_batch_size)?;
        parse_env("ETH_SETTLEMENT_SEND_TIMEOUT_SECS", &mut config.send_timeout_secs)?;
        parse_env("ETH_SETTLEMENT_SHUTDOWN_GRACE_SECS", &mut config.shutdown_grace_secs)?;
        parse_env(
            "ETH_SETTLEMENT_RESERVATION_MARGIN_SECS",
            &mut config.reservation_safety_margin_secs,
        )?;
        parse_env("ETH_SETTLEMENT_BLOCK_POLL_MS", &mut config.block_poll_interval_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.private_key.trim().is_empty() {
            return Err(crate::Error::Config("private_key is required".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.block_poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "block_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.scan_batch_size == 0 {
            return Err(crate::Error::Config(
                "scan_batch_size must be positive".to_string(),
            ));
        }
        if self.asset_scale > 18 {
            return Err(crate::Error::Config(format!(
                "asset_scale {} exceeds wei precision",
                self.asset_scale
            )));
        }
        Ok(())
    }

    /// Interval between sweeps
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Interval between block polls
    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms)
    }

    /// Receipt wait bound, `None` when disabled
    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_secs > 0).then(|| Duration::from_secs(self.send_timeout_secs))
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Stale reservation threshold
    pub fn reservation_safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_safety_margin_secs as i64)
    }
}

fn parse_env<T>(name: &str, target: &mut T) -> crate::Result<()>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Ok(raw) = env::var(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| crate::Error::Config(format!("{}={}: {}", name, raw, e)))?;
    }
    Ok(())
}
