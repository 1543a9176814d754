use http::{HeaderName, Method};
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::idempotency::{
    ConcurrencyMode, GateConfig, KeyDeriverConfig, KeyFormat, StoreFailurePolicy, TokenPolicy,
    DEFAULT_MAX_BODY_SIZE,
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[validate]
    pub redis: RedisSettings,
    #[validate]
    pub application: ApplicationSettings,
    #[validate]
    pub idempotency: IdempotencySettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RedisSettings {
    #[validate(length(min = 1))]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApplicationSettings {
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Where stored responses live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct IdempotencySettings {
    #[serde(default)]
    pub backend: StoreBackend,
    #[validate(length(min = 1))]
    pub header_key: String,
    #[validate(range(min = 1))]
    pub ttl_seconds: u64,
    #[validate(length(min = 1))]
    pub enforced_verbs: Vec<String>,
    #[validate(length(min = 1))]
    pub key_prefix: String,
    #[serde(default)]
    pub hash_keys: bool,
    /// Trusted header carrying the actor id. Extensions are used when unset.
    #[serde(default)]
    pub actor_header: Option<String>,
    #[validate(range(min = 1))]
    pub store_timeout_ms: u64,
    #[serde(default)]
    pub failure_policy: StoreFailurePolicy,
    #[serde(default)]
    pub concurrency: ConcurrencyMode,
    #[validate(range(min = 1))]
    pub lock_ttl_seconds: u64,
    #[serde(default)]
    pub enforce_token_timestamp: bool,
    #[validate(range(min = 0))]
    pub max_clock_skew_seconds: i64,
    /// Purge interval for the in-memory backend.
    #[validate(range(min = 1))]
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Largest response body buffered for replay.
    #[validate(range(min = 1))]
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

impl Settings {
    /// Loads `config/default`, then `config/local`, then `APP__*` variables.
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        Self::finish(builder.build()?)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;

        Self::finish(built)
    }

    fn finish(built: config::Config) -> Result<Self> {
        let settings: Settings = built.try_deserialize()?;
        settings
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        Ok(settings)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }

    pub fn actor_header(&self) -> Result<Option<HeaderName>> {
        self.idempotency
            .actor_header
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .map(|h| parse_header_name("actor_header", h))
            .transpose()
    }

    /// Builds the immutable gate configuration.
    pub fn gate_config(&self) -> Result<GateConfig> {
        let s = &self.idempotency;

        let header_name = parse_header_name("header_key", &s.header_key)?;
        let methods = s
            .enforced_verbs
            .iter()
            .map(|verb| {
                Method::from_bytes(verb.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                    AppError::Validation(format!("enforced_verbs: invalid method '{}'", verb))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let key = KeyDeriverConfig {
            key_prefix: s.key_prefix.clone(),
            format: if s.hash_keys {
                KeyFormat::Hashed
            } else {
                KeyFormat::Plain
            },
        };

        let token = TokenPolicy {
            enforce_timestamp: s.enforce_token_timestamp,
            max_clock_skew: chrono::Duration::seconds(s.max_clock_skew_seconds),
        };

        Ok(GateConfig::default()
            .with_header_name(header_name)
            .with_enforced_methods(methods)
            .with_ttl(Duration::from_secs(s.ttl_seconds))
            .with_key_config(key)
            .with_token_policy(token)
            .with_store_timeout(Duration::from_millis(s.store_timeout_ms))
            .with_failure_policy(s.failure_policy)
            .with_concurrency(s.concurrency, Duration::from_secs(s.lock_ttl_seconds))
            .with_max_body_size(s.max_body_size))
    }
}

fn parse_header_name(field: &str, value: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(value.trim().as_bytes())
        .map_err(|_| AppError::Validation(format!("{}: invalid header name '{}'", field, value)))
}
