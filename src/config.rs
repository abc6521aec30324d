use crate::domain::{Address, DEFAULT_FINGERPRINT_CAPACITY};
use crate::orchestration::{RecoveryScan, ReconcilerConfig};
use crate::retry::RetryPolicy;
use crate::stream::ListenerConfig;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub hyperliquid_api_url: String,
    pub hyperliquid_ws_url: String,
    pub monitored_user: Address,
    pub fingerprint_capacity: usize,
    pub heartbeat_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_retry: RetryPolicy,
    pub fetch_retry: RetryPolicy,
    pub fetch_timeout: Duration,
    pub sink_retry: RetryPolicy,
    pub sweep_interval: Option<Duration>,
    pub resume_retry: Duration,
    pub recovery_scan: RecoveryScan,
    pub lookback: Option<Duration>,
    pub sink: SinkKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    Log,
    Webhook { url: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = env_map
            .get("PORT")
            .map(|s| s.as_str())
            .unwrap_or("8080")
            .parse::<u16>()
            .map_err(|_| {
                ConfigError::InvalidValue("PORT".to_string(), "must be a valid u16".to_string())
            })?;

        let database_path = required(&env_map, "DATABASE_PATH")?;
        let hyperliquid_api_url = required(&env_map, "HYPERLIQUID_API_URL")?;
        let hyperliquid_ws_url = required(&env_map, "HYPERLIQUID_WS_URL")?;

        let monitored_user = required(&env_map, "MONITORED_USER")?;
        if !monitored_user.starts_with("0x") || monitored_user.len() < 3 {
            return Err(ConfigError::InvalidValue(
                "MONITORED_USER".to_string(),
                "must be a 0x-prefixed address".to_string(),
            ));
        }
        let monitored_user = Address::new(monitored_user);

        let fingerprint_capacity = parse_u64(
            &env_map,
            "FINGERPRINT_CAPACITY",
            DEFAULT_FINGERPRINT_CAPACITY as u64,
        )? as usize;
        if fingerprint_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "FINGERPRINT_CAPACITY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let heartbeat_timeout = positive_ms(&env_map, "HEARTBEAT_TIMEOUT_MS", 45_000)?;
        let ping_interval = positive_ms(&env_map, "PING_INTERVAL_MS", 20_000)?;

        let reconnect_retry = RetryPolicy {
            base: positive_ms(&env_map, "RECONNECT_BASE_MS", 1_000)?,
            cap: positive_ms(&env_map, "RECONNECT_CAP_MS", 60_000)?,
            ..RetryPolicy::reconnect()
        };
        let fetch_retry = RetryPolicy {
            base: positive_ms(&env_map, "FETCH_RETRY_BASE_MS", 1_000)?,
            cap: positive_ms(&env_map, "FETCH_RETRY_CAP_MS", 30_000)?,
            max_attempts: Some(attempts(&env_map, "FETCH_MAX_ATTEMPTS", 5)?),
            ..RetryPolicy::bulk_fetch()
        };
        let fetch_timeout = positive_ms(&env_map, "FETCH_TIMEOUT_MS", 30_000)?;
        let sink_retry = RetryPolicy {
            base: positive_ms(&env_map, "SINK_RETRY_BASE_MS", 500)?,
            cap: positive_ms(&env_map, "SINK_RETRY_CAP_MS", 10_000)?,
            max_attempts: Some(attempts(&env_map, "SINK_MAX_ATTEMPTS", 5)?),
            ..RetryPolicy::sink_delivery()
        };

        let sweep_interval = match parse_u64(&env_map, "SWEEP_INTERVAL_MS", 300_000)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let resume_retry = positive_ms(&env_map, "RESUME_RETRY_MS", 10_000)?;

        let recovery_scan = match env_map
            .get("RECOVERY_SCAN")
            .map(|s| s.as_str())
            .unwrap_or("early_stop")
        {
            "early_stop" => RecoveryScan::EarlyStop,
            "full" => RecoveryScan::Full,
            other => {
                return Err(ConfigError::InvalidValue(
                    "RECOVERY_SCAN".to_string(),
                    format!("must be early_stop or full, got {}", other),
                ))
            }
        };

        let lookback = match env_map.get("LOOKBACK_MS") {
            Some(_) => Some(positive_ms(&env_map, "LOOKBACK_MS", 0)?),
            None => None,
        };

        let sink = match env_map.get("SINK").map(|s| s.as_str()).unwrap_or("log") {
            "log" => SinkKind::Log,
            "webhook" => SinkKind::Webhook {
                url: required(&env_map, "WEBHOOK_URL")?,
            },
            other => {
                return Err(ConfigError::InvalidValue(
                    "SINK".to_string(),
                    format!("must be log or webhook, got {}", other),
                ))
            }
        };

        Ok(Config {
            port,
            database_path,
            hyperliquid_api_url,
            hyperliquid_ws_url,
            monitored_user,
            fingerprint_capacity,
            heartbeat_timeout,
            ping_interval,
            reconnect_retry,
            fetch_retry,
            fetch_timeout,
            sink_retry,
            sweep_interval,
            resume_retry,
            recovery_scan,
            lookback,
            sink,
        })
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            heartbeat_timeout: self.heartbeat_timeout,
            ping_interval: self.ping_interval,
            reconnect: self.reconnect_retry,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            fingerprint_capacity: self.fingerprint_capacity,
            sink_retry: self.sink_retry,
            sweep_interval: self.sweep_interval,
            resume_retry: self.resume_retry,
            lookback: self.lookback,
        }
    }
}

fn required(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    env_map
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn parse_u64(env_map: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    match env_map.get(key) {
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
            ConfigError::InvalidValue(key.to_string(), "must be a non-negative integer".to_string())
        }),
        None => Ok(default),
    }
}

fn positive_ms(
    env_map: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match parse_u64(env_map, key, default)? {
        0 => Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be greater than zero".to_string(),
        )),
        ms => Ok(Duration::from_millis(ms)),
    }
}

fn attempts(env_map: &HashMap<String, String>, key: &str, default: u32) -> Result<u32, ConfigError> {
    let n = parse_u64(env_map, key, u64::from(default))?;
    match u32::try_from(n) {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be between 1 and 4294967295".to_string(),
        )),
    }
}
