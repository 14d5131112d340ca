use dotenvy::dotenv;
use std::env;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,

    pub refresh_interval_secs: u64,
    pub registry_retry_secs: u64,

    pub default_broker_url: String,
    pub default_broker_port: u16,
    pub default_topic_prefix: String,

    pub log_file: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Sanity-check the reconciliation intervals.
    fn validate_intervals(&self) -> Result<(), ConfigError> {
        const MIN_SECS: u64 = 1;
        const MAX_SECS: u64 = 86_400;

        if !(MIN_SECS..=MAX_SECS).contains(&self.refresh_interval_secs) {
            return Err(ConfigError::ParsingError(format!(
                "REFRESH_INTERVAL_SECS must be between {} and {} seconds",
                MIN_SECS, MAX_SECS
            )));
        }
        if !(MIN_SECS..=MAX_SECS).contains(&self.registry_retry_secs) {
            return Err(ConfigError::ParsingError(format!(
                "REGISTRY_RETRY_SECS must be between {} and {} seconds",
                MIN_SECS, MAX_SECS
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let config = Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "sensorflux.db".to_string()),
            refresh_interval_secs: env::var("REFRESH_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::ParsingError(
                        "REFRESH_INTERVAL_SECS must be a valid number".to_string(),
                    )
                })?,
            registry_retry_secs: env::var("REGISTRY_RETRY_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::ParsingError(
                        "REGISTRY_RETRY_SECS must be a valid number".to_string(),
                    )
                })?,
            default_broker_url: env::var("BROKER")
                .unwrap_or_else(|_| "broker.emqx.io".to_string()),
            default_broker_port: env::var("PORT")
                .unwrap_or_else(|_| "1883".to_string())
                .parse::<u16>()
                .map_err(|_| {
                    ConfigError::ParsingError("PORT must be a valid port number".to_string())
                })?,
            default_topic_prefix: env::var("TOPIC_PREFIX")
                .unwrap_or_else(|_| "TEMP/SUB/".to_string()),
            log_file: env::var("LOG_FILE").ok(),
        };

        config.validate_intervals()?;

        Ok(config)
    }
}
