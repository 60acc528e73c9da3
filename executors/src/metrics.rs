use alloy::primitives::Address;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder, register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry,
};
use std::sync::Arc;

/// Metrics for the submission pipeline and block monitoring
pub struct SubmitterMetrics {
    pub current_block_number: IntGauge,
    pub watcher_restarts: IntCounterVec,
    pub transport_started: IntCounterVec,
    pub queue_rejections: IntCounterVec,
    pub buffered_requests: IntGauge,
    pub executor_job_count: IntGaugeVec,
    pub receipt_outcomes: IntCounterVec,
    pub request_queued_to_settled_duration: HistogramVec,
}

impl SubmitterMetrics {
    /// Create new submitter metrics with the provided registry
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let current_block_number = register_int_gauge_with_registry!(
            Opts::new(
                "boop_submitter_current_block_number",
                "Number of the latest block observed by the block watcher"
            ),
            registry
        )?;

        let watcher_restarts = register_int_counter_vec_with_registry!(
            Opts::new(
                "boop_submitter_block_watcher_restarts_total",
                "Block stream restarts performed by the block watcher"
            ),
            &["reason"],
            registry
        )?;

        let transport_started = register_int_counter_vec_with_registry!(
            Opts::new(
                "boop_submitter_block_stream_started_total",
                "Block streams successfully started, by transport kind"
            ),
            &["transport"],
            registry
        )?;

        let queue_rejections = register_int_counter_vec_with_registry!(
            Opts::new(
                "boop_submitter_queue_rejections_total",
                "Requests rejected by the nonce queue"
            ),
            &["reason"],
            registry
        )?;

        let buffered_requests = register_int_gauge_with_registry!(
            Opts::new(
                "boop_submitter_buffered_requests",
                "Requests currently held by the nonce queue, executing ones included"
            ),
            registry
        )?;

        let executor_job_count = register_int_gauge_vec_with_registry!(
            Opts::new(
                "boop_submitter_executor_job_count",
                "Live request hashes attributed to each executor"
            ),
            &["executor"],
            registry
        )?;

        let receipt_outcomes = register_int_counter_vec_with_registry!(
            Opts::new(
                "boop_submitter_receipt_outcomes_total",
                "Receipt waiters resolved, by outcome"
            ),
            &["outcome"],
            registry
        )?;

        let request_queued_to_settled_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "boop_submitter_request_queued_to_settled_duration_seconds",
                "Time from when a request is queued to when its execution settles"
            )
            .buckets(vec![
                0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0
            ]),
            &["outcome"],
            registry
        )?;

        Ok(SubmitterMetrics {
            current_block_number,
            watcher_restarts,
            transport_started,
            queue_rejections,
            buffered_requests,
            executor_job_count,
            receipt_outcomes,
            request_queued_to_settled_duration,
        })
    }
}

lazy_static! {
    /// Default metrics registry for the submitter (fallback if no external registry provided)
    static ref DEFAULT_SUBMITTER_METRICS_REGISTRY: Registry = Registry::new();

    /// Default metrics instance (used when no external metrics are provided)
    static ref DEFAULT_SUBMITTER_METRICS: Arc<SubmitterMetrics> = Arc::new(
        SubmitterMetrics::new(&DEFAULT_SUBMITTER_METRICS_REGISTRY)
            .expect("Failed to create default submitter metrics")
    );

    /// Global metrics instance - can be set by the binary crate or uses default
    static ref SUBMITTER_METRICS_INSTANCE: std::sync::RwLock<Option<Arc<SubmitterMetrics>>> =
        std::sync::RwLock::new(None);
}

/// Initialize submitter metrics with a custom registry
/// This should be called once at application startup by the binary crate
pub fn initialize_metrics(metrics: SubmitterMetrics) {
    let mut instance = SUBMITTER_METRICS_INSTANCE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *instance = Some(Arc::new(metrics));
}

/// Get the current metrics instance (either custom or default)
fn get_metrics() -> Arc<SubmitterMetrics> {
    let instance = SUBMITTER_METRICS_INSTANCE
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match instance.as_ref() {
        Some(metrics) => metrics.clone(),
        None => DEFAULT_SUBMITTER_METRICS.clone(),
    }
}

/// Export metrics in Prometheus format from the default registry
/// For custom registries, the binary crate should handle metrics export directly
pub fn export_default_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    export_metrics(&DEFAULT_SUBMITTER_METRICS_REGISTRY)
}

/// Export metrics in Prometheus format from the given registry
pub fn export_metrics(
    registry: &Registry,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn set_current_block(number: u64) {
    get_metrics()
        .current_block_number
        .set(i64::try_from(number).unwrap_or(i64::MAX));
}

pub fn record_watcher_restart(reason: &str) {
    get_metrics()
        .watcher_restarts
        .with_label_values(&[reason])
        .inc();
}

pub fn record_transport_started(transport: &str) {
    get_metrics()
        .transport_started
        .with_label_values(&[transport])
        .inc();
}

pub fn record_queue_rejection(reason: &str) {
    get_metrics()
        .queue_rejections
        .with_label_values(&[reason])
        .inc();
}

pub fn set_buffered_requests(count: usize) {
    get_metrics()
        .buffered_requests
        .set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn set_executor_job_count(executor: &Address, count: u64) {
    get_metrics()
        .executor_job_count
        .with_label_values(&[&executor.to_string()])
        .set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn record_receipt_outcome(outcome: &str) {
    get_metrics()
        .receipt_outcomes
        .with_label_values(&[outcome])
        .inc();
}

pub fn record_request_queued_to_settled(outcome: &str, duration_seconds: f64) {
    get_metrics()
        .request_queued_to_settled_duration
        .with_label_values(&[outcome])
        .observe(duration_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        set_current_block(42);
        record_watcher_restart("watchdog");
        record_transport_started("ws");
        record_queue_rejection("buffer_exceeded");
        set_buffered_requests(3);
        set_executor_job_count(&Address::repeat_byte(1), 2);
        record_receipt_outcome("receipt");
        record_request_queued_to_settled("included", 1.5);

        let metrics_output =
            export_default_metrics().expect("Should be able to export default metrics");
        assert!(metrics_output.contains("boop_submitter_current_block_number"));
        assert!(metrics_output.contains("boop_submitter_block_watcher_restarts_total"));
        assert!(metrics_output.contains("boop_submitter_queue_rejections_total"));
        assert!(metrics_output.contains("boop_submitter_executor_job_count"));
        assert!(
            metrics_output.contains("boop_submitter_request_queued_to_settled_duration_seconds")
        );
    }

    #[test]
    fn test_custom_metrics_registry() {
        let custom_registry = Registry::new();
        let custom_metrics =
            SubmitterMetrics::new(&custom_registry).expect("Should create custom metrics");

        custom_metrics
            .queue_rejections
            .with_label_values(&["custom_test"])
            .inc();

        let metrics_output = export_metrics(&custom_registry).expect("Should encode metrics");
        assert!(metrics_output.contains("boop_submitter_queue_rejections_total"));
        assert!(metrics_output.contains("custom_test"));
    }
}
