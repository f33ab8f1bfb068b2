//! Main application configuration
//!
//! This module defines the primary configuration structures for the
//! campus-match live match service, including environment variable loading
//! and validation.

use crate::error::LiveMatchError;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub matching: MatchingSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port for the metrics and health endpoint
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
}

/// Matching-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingSettings {
    /// Search timeout in seconds; 0 means searches wait indefinitely
    pub search_timeout_seconds: u64,
    /// Interval for sweeping disconnected candidates out of the pool
    pub sweep_interval_seconds: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "campus-match".to_string(),
            log_level: "info".to_string(),
            metrics_port: 8080,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            search_timeout_seconds: 0, // 0 = search forever
            sweep_interval_seconds: 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            config.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.service.log_level = log_level;
        }
        if let Ok(port) = env::var("METRICS_PORT") {
            config.service.metrics_port = port
                .parse()
                .map_err(|_| anyhow!("Invalid METRICS_PORT value: {}", port))?;
        }
        if let Ok(timeout) = env::var("SHUTDOWN_TIMEOUT_SECONDS") {
            config.service.shutdown_timeout_seconds = timeout
                .parse()
                .map_err(|_| anyhow!("Invalid SHUTDOWN_TIMEOUT_SECONDS value: {}", timeout))?;
        }

        // Matching settings
        if let Ok(search_timeout) = env::var("SEARCH_TIMEOUT_SECONDS") {
            config.matching.search_timeout_seconds = search_timeout
                .parse()
                .map_err(|_| anyhow!("Invalid SEARCH_TIMEOUT_SECONDS value: {}", search_timeout))?;
        }
        if let Ok(sweep) = env::var("SWEEP_INTERVAL_SECONDS") {
            config.matching.sweep_interval_seconds = sweep
                .parse()
                .map_err(|_| anyhow!("Invalid SWEEP_INTERVAL_SECONDS value: {}", sweep))?;
        }

        validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path.display(), e))?;

        validate_config(&config)?;
        Ok(config)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Get search timeout as Duration; None means unbounded
    pub fn search_timeout(&self) -> Option<Duration> {
        match self.matching.search_timeout_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }

    /// Get pool sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.matching.sweep_interval_seconds)
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    fn invalid(message: String) -> anyhow::Error {
        LiveMatchError::ConfigurationError { message }.into()
    }

    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => {
            return Err(invalid(format!(
                "Invalid log level: {}",
                config.service.log_level
            )))
        }
    }

    // Validate ports
    if config.service.metrics_port == 0 {
        return Err(invalid("Metrics port cannot be 0".to_string()));
    }

    // Validate timeouts
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(invalid("Shutdown timeout must be greater than 0".to_string()));
    }
    if config.matching.sweep_interval_seconds == 0 {
        return Err(invalid("Sweep interval must be greater than 0".to_string()));
    }

    Ok(())
}
