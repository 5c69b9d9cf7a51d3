//! Configuration module for environment variable parsing.
//!
//! Both services read their settings from the environment once at startup.
//! Only `RABBITMQ_URL` is required; it is validated when the connection is
//! opened, so a missing value surfaces as a configuration error from
//! `ConnectionManager::connect`.

use std::env;
use std::fmt;

use tracing::warn;
use url::Url;

use crate::error::{QueueError, Result};
use crate::queue::FailurePolicy;

/// Environment variable holding the broker connection string.
pub const BROKER_URL_VAR: &str = "RABBITMQ_URL";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Raw broker URL, validated by [`BrokerEndpoint::parse`]
    pub rabbitmq_url: Option<String>,

    /// Queue shared by the web service and the consumer
    pub queue_name: String,

    /// Port for the web service to listen on
    pub port: u16,

    /// Port for the consumer's health endpoint
    pub consumer_port: u16,

    /// AMQP consumer tag; empty lets the broker pick one
    pub consumer_tag: String,

    /// Optional QoS prefetch applied before consuming
    pub prefetch_count: Option<u16>,

    /// Durable flag used when declaring queues
    pub queue_durable: bool,

    /// What to do with a message whose handler returned an error
    pub handler_failure_policy: FailurePolicy,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            rabbitmq_url: env::var(BROKER_URL_VAR).ok(),

            queue_name: env::var("QUEUE_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "my_queue".to_string()),

            port: parse_or("PORT", 4000),

            consumer_port: parse_or("CONSUMER_PORT", 4001),

            consumer_tag: env::var("CONSUMER_TAG").unwrap_or_default(),

            prefetch_count: env::var("PREFETCH_COUNT").ok().and_then(|raw| {
                match raw.trim().parse() {
                    Ok(count) => Some(count),
                    Err(_) => {
                        warn!(env_var = "PREFETCH_COUNT", value = %raw, "Invalid prefetch, ignoring");
                        None
                    }
                }
            }),

            queue_durable: parse_or("QUEUE_DURABLE", true),

            handler_failure_policy: parse_or("HANDLER_FAILURE_POLICY", FailurePolicy::Ack),
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn parse_or<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

/// A validated broker connection string.
///
/// The full URL (credentials included) is handed to the AMQP client; only
/// scheme, host and port are ever written to logs.
#[derive(Clone)]
pub struct BrokerEndpoint {
    raw: String,
    url: Url,
}

impl BrokerEndpoint {
    /// Validate a raw broker URL.
    ///
    /// Absent or blank input, an unparseable URL, a scheme other than
    /// `amqp`/`amqps`, or a missing host are all configuration errors.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let raw = match raw.map(str::trim) {
            Some(v) if !v.is_empty() => v,
            _ => {
                return Err(QueueError::Configuration(format!(
                    "{BROKER_URL_VAR} environment variable is not set"
                )))
            }
        };

        let url = Url::parse(raw).map_err(|e| {
            QueueError::Configuration(format!("{BROKER_URL_VAR} is not a valid URL: {e}"))
        })?;

        if !matches!(url.scheme(), "amqp" | "amqps") {
            return Err(QueueError::Configuration(format!(
                "{BROKER_URL_VAR} must use the amqp or amqps scheme, got `{}`",
                url.scheme()
            )));
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(QueueError::Configuration(format!(
                "{BROKER_URL_VAR} has no host"
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            url,
        })
    }

    /// Full connection string, credentials included.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Explicit port, or the scheme default (5672 / 5671).
    pub fn port(&self) -> u16 {
        self.url
            .port()
            .unwrap_or(if self.scheme() == "amqps" { 5671 } else { 5672 })
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("scheme", &self.scheme())
            .field("host", &self.host())
            .field("port", &self.port())
            .finish()
    }
}
