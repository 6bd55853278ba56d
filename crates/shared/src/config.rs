//! Application configuration
//!
//! Loaded once at process start from environment variables and passed by
//! reference into every component. There is no global settings object.

use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Process-wide configuration
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Stripe
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    /// Override for tests; production always talks to api.stripe.com
    pub stripe_api_base: String,

    // Webhooks
    /// Maximum accepted age of a signed webhook timestamp, in seconds
    pub webhook_tolerance_secs: i64,
    /// Alert threshold for events Stripe has that we never ingested
    pub pending_events_threshold: usize,

    // Batch jobs
    /// Mandatory delay between remote calls in batch loops (4 req/s default)
    pub batch_pace_ms: u64,

    // Server
    pub bind_address: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .map_err(|_| ConfigError::Missing("STRIPE_SECRET_KEY"))?,
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?,
            stripe_api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            webhook_tolerance_secs: parse_var("STRIPE_WEBHOOK_TOLERANCE_SECS", 300)?,
            pending_events_threshold: parse_var("STRIPE_PENDING_EVENTS_THRESHOLD", 20)?,
            batch_pace_ms: parse_var("STRIPE_BATCH_PACE_MS", 250)?,
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw.clone())),
        Err(_) => Ok(default),
    }
}
