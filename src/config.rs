//! Configuration for a faces service.

use crate::fault::{FaultConfig, DEFAULT_ERROR_TEXT};
use crate::faces::ServiceKind;
use http::header::HeaderName;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `FACES_SERVICE` is unset.
    #[error("FACES_SERVICE must be set")]
    MissingService,

    /// `FACES_SERVICE` names something this binary cannot serve.
    #[error("invalid FACES_SERVICE: {0}")]
    InvalidService(String),

    /// Invalid listen address format.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    /// Invalid metrics address format.
    #[error("invalid metrics address '{addr}': {reason}")]
    InvalidMetricsAddr { addr: String, reason: String },

    /// Duplicate listen and metrics addresses.
    #[error("listen address and metrics address cannot be the same: {addr}")]
    DuplicateAddrs { addr: String },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// The user header name cannot be used as an HTTP header.
    #[error("invalid user header name '{name}'")]
    InvalidUserHeader { name: String },

    /// A dependency address does not form a valid URL.
    #[error("invalid dependency address '{addr}': {reason}")]
    InvalidDependencyAddr { addr: String, reason: String },
}

/// Service configuration loaded once at startup.
///
/// # Environment Variables
///
/// * `FACES_SERVICE` - `color`, `smiley`, `shape`, `quote` or `face` (required)
/// * `FACES_LISTEN_ADDR` - Address to listen on (default: "0.0.0.0:8000")
/// * `FACES_METRICS_ADDR` - Admin endpoint address (default: "0.0.0.0:9090")
/// * `ERROR_FRACTION` - Percent of requests to fail, 0-100 (default: 0)
/// * `LATCH_FRACTION` - Percent of failures that latch, 0-100 (default: 0)
/// * `DELAY_BUCKETS` - Comma-separated delays in milliseconds (default: none)
/// * `MAX_RATE` - Requests per second before rate limiting (default: 0, off)
/// * `DEBUG_ENABLED` - Log at debug level (default: false)
/// * `USER_HEADER_NAME` - Header carrying the caller's identity (default: "X-Faces-User")
/// * `HOST_IP` / `HOSTNAME` - Value of the `X-Faces-Pod` header (default: "unknown")
/// * `SMILEY_SERVICE` / `COLOR_SERVICE` - Dependency addresses for `face`
/// * `SMILEY` - Smiley name served by `smiley` (default: "Smiling")
/// * `COLOR` - Color served by `color` (default: "green")
/// * `FACES_REQUEST_TIMEOUT_MS` - Dependency timeout in milliseconds (default: 5000)
#[derive(Debug, Clone)]
pub struct FacesConfig {
    pub service: ServiceKind,
    pub listen_addr: String,
    pub metrics_addr: String,
    pub error_fraction: u8,
    pub latch_fraction: u8,
    pub delay_buckets: Vec<u64>,
    /// Zero disables rate limiting.
    pub max_rate: f64,
    pub debug_enabled: bool,
    pub user_header_name: String,
    pub host_id: String,
    pub smiley_service: String,
    pub color_service: String,
    pub smiley: String,
    pub color: String,
    pub request_timeout: Duration,
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            service: ServiceKind::Face,
            listen_addr: "0.0.0.0:8000".to_string(),
            metrics_addr: "0.0.0.0:9090".to_string(),
            error_fraction: 0,
            latch_fraction: 0,
            delay_buckets: Vec::new(),
            max_rate: 0.0,
            debug_enabled: false,
            user_header_name: "X-Faces-User".to_string(),
            host_id: "unknown".to_string(),
            smiley_service: "smiley".to_string(),
            color_service: "color".to_string(),
            smiley: "Smiling".to_string(),
            color: "green".to_string(),
            request_timeout: Duration::from_millis(5000),
        }
    }
}

/// Reads a variable, treating empty as unset.
fn string_from_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parses a percentage, clamping to 0-100. Unparsable input gives 0.
pub fn parse_percentage(value: &str) -> u8 {
    value
        .trim()
        .parse::<i64>()
        .map(|v| v.clamp(0, 100) as u8)
        .unwrap_or(0)
}

/// Parses a comma-separated delay list, skipping junk and clamping
/// negatives to zero.
pub fn parse_delay_buckets(value: &str) -> Vec<u64> {
    value
        .split(',')
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .map(|v| v.max(0) as u64)
        .collect()
}

/// Parses a rate ceiling, clamping negatives to zero.
pub fn parse_max_rate(value: &str) -> f64 {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.max(0.0))
        .unwrap_or(0.0)
}

/// Parses a boolean the way the deployment manifests spell them.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl FacesConfig {
    /// Loads configuration from environment variables with fallback to
    /// defaults. Only `FACES_SERVICE` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let service = string_from_env("FACES_SERVICE")
            .ok_or(ConfigError::MissingService)?
            .parse::<ServiceKind>()
            .map_err(ConfigError::InvalidService)?;

        let request_timeout = string_from_env("FACES_REQUEST_TIMEOUT_MS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout);

        let host_id = string_from_env("HOST_IP")
            .or_else(|| string_from_env("HOSTNAME"))
            .unwrap_or(defaults.host_id);

        Ok(Self {
            service,
            listen_addr: string_from_env("FACES_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            metrics_addr: string_from_env("FACES_METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            error_fraction: string_from_env("ERROR_FRACTION")
                .map(|v| parse_percentage(&v))
                .unwrap_or(0),
            latch_fraction: string_from_env("LATCH_FRACTION")
                .map(|v| parse_percentage(&v))
                .unwrap_or(0),
            delay_buckets: string_from_env("DELAY_BUCKETS")
                .map(|v| parse_delay_buckets(&v))
                .unwrap_or_default(),
            max_rate: string_from_env("MAX_RATE")
                .map(|v| parse_max_rate(&v))
                .unwrap_or(0.0),
            debug_enabled: string_from_env("DEBUG_ENABLED")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            user_header_name: string_from_env("USER_HEADER_NAME")
                .unwrap_or(defaults.user_header_name),
            host_id,
            smiley_service: string_from_env("SMILEY_SERVICE").unwrap_or(defaults.smiley_service),
            color_service: string_from_env("COLOR_SERVICE").unwrap_or(defaults.color_service),
            smiley: string_from_env("SMILEY").unwrap_or(defaults.smiley),
            color: string_from_env("COLOR").unwrap_or(defaults.color),
            request_timeout,
        })
    }

    /// Loads configuration from environment variables and validates it.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Listen or metrics address is not a valid socket address
    /// - Listen and metrics addresses are the same
    /// - Timeout is zero or too large
    /// - The user header name is not a valid header name
    /// - A dependency address does not form a valid URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        self.metrics_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidMetricsAddr {
                addr: self.metrics_addr.clone(),
                reason: e.to_string(),
            })?;

        if self.listen_addr == self.metrics_addr {
            return Err(ConfigError::DuplicateAddrs {
                addr: self.listen_addr.clone(),
            });
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                reason: "timeout must be greater than zero".to_string(),
            });
        }

        if self.request_timeout > Duration::from_secs(3600) {
            return Err(ConfigError::InvalidTimeout {
                reason: "timeout must not exceed 1 hour".to_string(),
            });
        }

        self.user_header()?;

        if self.service == ServiceKind::Face {
            for addr in [&self.smiley_service, &self.color_service] {
                url::Url::parse(&format!("http://{}/", addr)).map_err(|e| {
                    ConfigError::InvalidDependencyAddr {
                        addr: addr.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
        }

        Ok(())
    }

    /// The user header as a typed header name.
    pub fn user_header(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::try_from(self.user_header_name.trim()).map_err(|_| {
            ConfigError::InvalidUserHeader {
                name: self.user_header_name.clone(),
            }
        })
    }

    /// Fault injection settings for this service.
    pub fn fault_config(&self) -> FaultConfig {
        FaultConfig::new(self.error_fraction, self.latch_fraction)
            .with_delay_buckets(self.delay_buckets.clone())
            .with_error_text(DEFAULT_ERROR_TEXT)
    }
}
