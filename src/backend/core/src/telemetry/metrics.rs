//! Prometheus metrics for the claim-and-dispatch pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! use mailflow_core::telemetry::metrics::PipelineMetrics;
//!
//! PipelineMetrics::record_claimed(250);
//! PipelineMetrics::set_queue_depth(40);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address the Prometheus scrape endpoint listens on
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for send durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0]
}

/// Install the Prometheus recorder and its HTTP scrape listener.
///
/// Must be called from within a tokio runtime. Does nothing when disabled.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.endpoint.parse()?;

    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;
    builder.install()?;

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = %config.endpoint,
        "Metrics initialized"
    );

    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!(
        "mailflow_jobs_claimed_total",
        "Jobs moved from Created to InFlight by the scheduler"
    );
    describe_counter!(
        "mailflow_jobs_skipped_total",
        "Claimed jobs not handed off because their content could not be resolved"
    );
    describe_counter!(
        "mailflow_claim_errors_total",
        "Scheduler ticks aborted by a claim error"
    );
    describe_counter!("mailflow_sends_total", "Completed sends by outcome");
    describe_histogram!(
        "mailflow_send_duration_seconds",
        "Gateway call duration in seconds"
    );
    describe_gauge!(
        "mailflow_handoff_queue_depth",
        "Jobs waiting in the hand-off queue"
    );
    describe_gauge!("mailflow_sends_in_flight", "Gateway calls currently outstanding");
    describe_counter!("mailflow_errors_total", "Errors by code and category");
}

/// Outcome label for `mailflow_sends_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcomeLabel {
    Sent,
    Failed,
    Timeout,
    Panicked,
}

impl SendOutcomeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Panicked => "panicked",
        }
    }
}

/// Pipeline-level metric helpers.
pub struct PipelineMetrics;

impl PipelineMetrics {
    pub fn record_claimed(count: u64) {
        counter!("mailflow_jobs_claimed_total").increment(count);
    }

    pub fn record_skipped(reason: &'static str) {
        counter!("mailflow_jobs_skipped_total", "reason" => reason).increment(1);
    }

    pub fn record_claim_error() {
        counter!("mailflow_claim_errors_total").increment(1);
    }

    pub fn record_send(outcome: SendOutcomeLabel, elapsed: Duration) {
        counter!("mailflow_sends_total", "outcome" => outcome.as_str()).increment(1);
        histogram!("mailflow_send_duration_seconds").record(elapsed.as_secs_f64());
    }

    pub fn set_queue_depth(depth: usize) {
        gauge!("mailflow_handoff_queue_depth").set(depth as f64);
    }

    pub fn set_in_flight(count: usize) {
        gauge!("mailflow_sends_in_flight").set(count as f64);
    }
}
