use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

use crate::db::DEFAULT_DB_TIMEOUT_MS;

pub const DEFAULT_PUBLISH_TOPIC: &str = "advice";
pub const DEFAULT_CONTENT_SOURCE_URL: &str = "https://api.adviceslip.com/advice";

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub db_timeout_ms: u64,
    pub verify_timeout_ms: u64,
    pub delivery_timeout_ms: u64,
    pub max_concurrent_deliveries: usize,
    pub max_delivery_failures: u32,
    pub publish_topic: String,
    /// Bearer token that enables `POST /publish`; the route is absent without it.
    pub publish_token: Option<String>,
    pub content_source_url: String,
    pub content_source_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid HUB_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid HUB_DB_TIMEOUT_MS: {0}")]
    InvalidDbTimeoutMs(String),
    #[error("invalid HUB_VERIFY_TIMEOUT_MS: {0}")]
    InvalidVerifyTimeoutMs(String),
    #[error("invalid HUB_DELIVERY_TIMEOUT_MS: {0}")]
    InvalidDeliveryTimeoutMs(String),
    #[error("invalid HUB_MAX_CONCURRENT_DELIVERIES: {0}")]
    InvalidMaxConcurrentDeliveries(String),
    #[error("invalid HUB_MAX_DELIVERY_FAILURES: {0}")]
    InvalidMaxDeliveryFailures(String),
    #[error("invalid HUB_PUBLISH_TOPIC: {0}")]
    InvalidPublishTopic(String),
    #[error("invalid HUB_CONTENT_SOURCE_URL: {0}")]
    InvalidContentSourceUrl(String),
    #[error("invalid HUB_CONTENT_SOURCE_TIMEOUT_MS: {0}")]
    InvalidContentSourceTimeoutMs(String),
    #[error("invalid HUB_SHUTDOWN_GRACE_MS: {0}")]
    InvalidShutdownGraceMs(String),
    #[error("invalid HUB_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("HUB_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;
        let service_name =
            env::var("HUB_SERVICE_NAME").unwrap_or_else(|_| "websub-hub".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let db_timeout_ms = env::var("HUB_DB_TIMEOUT_MS")
            .unwrap_or_else(|_| DEFAULT_DB_TIMEOUT_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidDbTimeoutMs(error.to_string()))?
            .clamp(100, 60_000);

        let verify_timeout_ms = env::var("HUB_VERIFY_TIMEOUT_MS")
            .unwrap_or_else(|_| "10000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidVerifyTimeoutMs(error.to_string()))?
            .clamp(250, 120_000);
        let delivery_timeout_ms = env::var("HUB_DELIVERY_TIMEOUT_MS")
            .unwrap_or_else(|_| "10000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidDeliveryTimeoutMs(error.to_string()))?
            .clamp(250, 120_000);
        let max_concurrent_deliveries = env::var("HUB_MAX_CONCURRENT_DELIVERIES")
            .unwrap_or_else(|_| "64".to_string())
            .parse::<usize>()
            .map_err(|error| ConfigError::InvalidMaxConcurrentDeliveries(error.to_string()))?
            .clamp(1, 4096);
        let max_delivery_failures = env::var("HUB_MAX_DELIVERY_FAILURES")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<u32>()
            .map_err(|error| ConfigError::InvalidMaxDeliveryFailures(error.to_string()))?
            .max(1);

        let publish_topic = env::var("HUB_PUBLISH_TOPIC")
            .unwrap_or_else(|_| DEFAULT_PUBLISH_TOPIC.to_string())
            .trim()
            .to_string();
        if publish_topic.is_empty() {
            return Err(ConfigError::InvalidPublishTopic(
                "topic must not be empty".to_string(),
            ));
        }
        let publish_token = env::var("HUB_PUBLISH_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let content_source_url = env::var("HUB_CONTENT_SOURCE_URL")
            .unwrap_or_else(|_| DEFAULT_CONTENT_SOURCE_URL.to_string())
            .trim()
            .to_string();
        reqwest::Url::parse(&content_source_url)
            .map_err(|error| ConfigError::InvalidContentSourceUrl(error.to_string()))?;
        let content_source_timeout_ms = env::var("HUB_CONTENT_SOURCE_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidContentSourceTimeoutMs(error.to_string()))?
            .clamp(250, 60_000);

        let shutdown_grace_ms = env::var("HUB_SHUTDOWN_GRACE_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidShutdownGraceMs(error.to_string()))?
            .min(300_000);

        let log_format = parse_log_format(
            env::var("HUB_LOG_FORMAT")
                .unwrap_or_else(|_| "text".to_string())
                .as_str(),
        )?;

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            db_timeout_ms,
            verify_timeout_ms,
            delivery_timeout_ms,
            max_concurrent_deliveries,
            max_delivery_failures,
            publish_topic,
            publish_token,
            content_source_url,
            content_source_timeout_ms,
            shutdown_grace_ms,
            log_format,
        })
    }

    /// Settings for tests and embedded use: in-memory store, loopback bind, short timeouts.
    #[must_use]
    pub fn local() -> Self {
        Self {
            service_name: "websub-hub".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            db_url: None,
            db_timeout_ms: 2_000,
            verify_timeout_ms: 2_000,
            delivery_timeout_ms: 2_000,
            max_concurrent_deliveries: 16,
            max_delivery_failures: 1,
            publish_topic: DEFAULT_PUBLISH_TOPIC.to_string(),
            publish_token: None,
            content_source_url: DEFAULT_CONTENT_SOURCE_URL.to_string(),
            content_source_timeout_ms: 2_000,
            shutdown_grace_ms: 1_000,
            log_format: LogFormat::Text,
        }
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "text" | "pretty" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::InvalidLogFormat(other.to_string())),
    }
}
