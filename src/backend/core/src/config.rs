//! Configuration management.
//!
//! Values come from an optional file plus `MAILFLOW__*` environment variables
//! (`MAILFLOW__DISPATCH__RATE_PER_SECOND=14`). Everything here is read once at
//! startup and treated as fixed for the lifetime of a pipeline.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{MailflowError, Result};
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "MAILFLOW";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Claim and dispatch tuning
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Delivery gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Tuning for the scheduler and dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Target sends per second; also the token bucket capacity
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: u32,

    /// Maximum rows per claim statement
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Time between scheduler ticks
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum simultaneous gateway calls (defaults to twice the rate)
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Upper bound for a single gateway call
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// How long shutdown waits for admitted sends
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Capacity of the scheduler to dispatcher hand-off queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Throughput reporting window
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Base URL used for the open-tracking pixel
    #[serde(default = "default_tracking_base_url")]
    pub tracking_base_url: String,

    /// Run the first tick at startup instead of after one interval
    #[serde(default)]
    pub run_immediately: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            rate_per_second: default_rate_per_second(),
            batch_size: default_batch_size(),
            interval: default_interval(),
            max_concurrent: None,
            send_timeout: default_send_timeout(),
            drain_timeout: default_drain_timeout(),
            queue_capacity: default_queue_capacity(),
            report_interval: default_report_interval(),
            tracking_base_url: default_tracking_base_url(),
            run_immediately: false,
        }
    }
}

impl DispatchConfig {
    /// Concurrency cap actually applied to the send pool.
    pub fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent
            .unwrap_or_else(|| self.rate_per_second as usize * 2)
    }

    /// Jobs a single tick may claim: rate x interval seconds.
    pub fn tick_quota(&self) -> u64 {
        u64::from(self.rate_per_second) * self.interval.as_secs()
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_per_second == 0 {
            return Err(MailflowError::invalid_config(
                "dispatch.rate_per_second",
                "must be greater than zero",
            ));
        }
        if self.batch_size == 0 {
            return Err(MailflowError::invalid_config(
                "dispatch.batch_size",
                "must be greater than zero",
            ));
        }
        if self.interval.as_secs() == 0 {
            return Err(MailflowError::invalid_config(
                "dispatch.interval",
                "must be at least one second",
            ));
        }
        if self.effective_max_concurrent() == 0 {
            return Err(MailflowError::invalid_config(
                "dispatch.max_concurrent",
                "must be greater than zero",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(MailflowError::invalid_config(
                "dispatch.queue_capacity",
                "must be greater than zero",
            ));
        }
        for (field, value) in [
            ("dispatch.send_timeout", self.send_timeout),
            ("dispatch.drain_timeout", self.drain_timeout),
            ("dispatch.report_interval", self.report_interval),
        ] {
            if value.is_zero() {
                return Err(MailflowError::invalid_config(field, "must be non-zero"));
            }
        }
        Ok(())
    }
}

/// Amazon SES settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Verified From address; required to start the daemon
    #[serde(default)]
    pub sender: Option<String>,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Optional SES configuration set for event publishing
    #[serde(default)]
    pub configuration_set: Option<String>,

    /// Static credentials; the default AWS provider chain is used when absent
    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sender: None,
            region: default_region(),
            configuration_set: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 5 }
fn default_rate_per_second() -> u32 { 14 }
fn default_batch_size() -> u32 { 1000 }
fn default_interval() -> Duration { Duration::from_secs(60) }
fn default_send_timeout() -> Duration { Duration::from_secs(30) }
fn default_drain_timeout() -> Duration { Duration::from_secs(30) }
fn default_queue_capacity() -> usize { 1000 }
fn default_report_interval() -> Duration { Duration::from_secs(5) }
fn default_tracking_base_url() -> String { "http://localhost:3000".to_string() }
fn default_region() -> String { "ap-northeast-2".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.dispatch.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.dispatch.validate()?;
        Ok(cfg)
    }
}
