//! Gateway configuration module
//!
//! Handles loading configuration from environment variables.

use crate::error::GatewayError;
use crate::http::client::{HttpConfig, DEFAULT_API_BASE, DEFAULT_MAX_RETRIES};
use crate::ratelimit::DEFAULT_COMMAND_LIMIT;
use crate::shard::ShardConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// GUILDS | GUILD_MEMBERS
pub const DEFAULT_INTENTS: u64 = (1 << 0) | (1 << 1);

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Pool ID for this gateway instance (0-indexed)
    /// Each pool manages SHARDS_PER_POOL shards
    pub pool_id: u64,

    /// Total number of shards across all pools
    pub total_shards: u64,

    /// Gateway intents bitfield
    pub intents: u64,

    /// Gateway and REST API version
    pub api_version: u8,

    pub gateway_url: String,

    pub api_base_url: String,

    /// Zombie detection window
    pub heartbeat_timeout: Duration,

    /// Non-heartbeat gateway commands per 60 s window
    pub command_limit: u32,

    /// REST retry bound for 429 responses
    pub http_max_retries: u32,

    /// False for REST-only deployments
    pub gateway_enabled: bool,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let discord_token = lookup("DISCORD_TOKEN")
            .or_else(|| lookup("DISCORD_BOT_TOKEN"))
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let value = |key: &str, fallback: Option<&str>, default: &str| -> String {
            lookup(key)
                .or_else(|| fallback.and_then(|k| lookup(k)))
                .unwrap_or_else(|| default.to_string())
        };

        let pool_id = number("POOL_ID", &value("POOL_ID", None, "0"))?;
        let total_shards: u64 = number("TOTAL_SHARDS", &value("TOTAL_SHARDS", None, "1"))?;
        if total_shards == 0 {
            return Err(GatewayError::Config("TOTAL_SHARDS must be at least 1".to_string()));
        }

        let http_port = number(
            "HTTP_PORT",
            &value("HTTP_PORT", Some("METRICS_PORT"), "9090"),
        )?;

        Ok(Self {
            discord_token,
            pool_id,
            total_shards,
            intents: number("INTENTS", &value("INTENTS", None, &DEFAULT_INTENTS.to_string()))?,
            api_version: number("API_VERSION", &value("API_VERSION", None, "10"))?,
            gateway_url: value("GATEWAY_URL", None, DEFAULT_GATEWAY_URL),
            api_base_url: value("API_BASE_URL", None, DEFAULT_API_BASE),
            heartbeat_timeout: Duration::from_secs(number(
                "HEARTBEAT_TIMEOUT_SECS",
                &value("HEARTBEAT_TIMEOUT_SECS", None, "60"),
            )?),
            command_limit: number(
                "GATEWAY_COMMAND_LIMIT",
                &value("GATEWAY_COMMAND_LIMIT", None, &DEFAULT_COMMAND_LIMIT.to_string()),
            )?,
            http_max_retries: number(
                "HTTP_MAX_RETRIES",
                &value("HTTP_MAX_RETRIES", None, &DEFAULT_MAX_RETRIES.to_string()),
            )?,
            gateway_enabled: number("GATEWAY_ENABLED", &value("GATEWAY_ENABLED", None, "true"))?,
            nats_url: lookup("NATS_URL").filter(|url| !url.is_empty()),
            http_port,
            log_level: value("LOG_LEVEL", None, "info"),
        })
    }

    /// Settings shared by every shard of the pool
    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            token: self.discord_token.clone(),
            intents: self.intents,
            gateway_url: self.gateway_url.clone(),
            version: self.api_version,
            heartbeat_timeout: self.heartbeat_timeout,
            command_limit: self.command_limit,
            gateway_enabled: self.gateway_enabled,
        }
    }

    pub fn http_config(&self) -> HttpConfig {
        let mut config = HttpConfig::new(self.discord_token.clone());
        config.api_base = self.api_base_url.clone();
        config.version = self.api_version;
        config.max_retries = self.http_max_retries;
        config
    }
}

fn number<T>(key: &str, value: &str) -> Result<T, GatewayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| GatewayError::Config(format!("{key} must be a valid value: {e}")))
}
