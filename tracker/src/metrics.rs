//! Prometheus metrics for the emitters

use crate::error::{Result, TrackerError};
use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All tracker metrics
pub struct Metrics {
    /// Requests sent (by emitter, outcome)
    pub requests: CounterVec,

    /// Events delivered (by emitter)
    pub events_sent: CounterVec,

    /// Events whose request failed (by emitter)
    pub events_failed: CounterVec,

    /// Events currently buffered across sinks
    pub buffer_size: Gauge,

    /// Queue files finished by workers (by result)
    pub queue_files: CounterVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            requests: register_counter_vec!(
                "tracker_requests_total",
                "Total collector requests",
                &["emitter", "outcome"]
            )
            .map_err(|e| TrackerError::Metrics(format!("requests: {e}")))?,

            events_sent: register_counter_vec!(
                "tracker_events_sent_total",
                "Total events delivered to the collector",
                &["emitter"]
            )
            .map_err(|e| TrackerError::Metrics(format!("events_sent: {e}")))?,

            events_failed: register_counter_vec!(
                "tracker_events_failed_total",
                "Total events in failed requests",
                &["emitter"]
            )
            .map_err(|e| TrackerError::Metrics(format!("events_failed: {e}")))?,

            buffer_size: register_gauge!(
                "tracker_buffer_size",
                "Events waiting in sink buffers"
            )
            .map_err(|e| TrackerError::Metrics(format!("buffer_size: {e}")))?,

            queue_files: register_counter_vec!(
                "tracker_queue_files_total",
                "Queue files processed by workers",
                &["result"]
            )
            .map_err(|e| TrackerError::Metrics(format!("queue_files: {e}")))?,
        };

        // Only the first caller wins; later ones read the stored instance
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| TrackerError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_request(&self, emitter: &str, success: bool, events: u64) {
        let outcome = if success { "success" } else { "failure" };
        self.requests
            .with_label_values(&[emitter, outcome])
            .inc();
        if success {
            self.events_sent
                .with_label_values(&[emitter])
                .inc_by(events as f64);
        } else {
            self.events_failed
                .with_label_values(&[emitter])
                .inc_by(events as f64);
        }
    }

    pub fn add_buffered(&self, delta: f64) {
        self.buffer_size.add(delta);
    }

    pub fn record_queue_file(&self, result: &str) {
        self.queue_files.with_label_values(&[result]).inc();
    }
}

/// Gather all metrics and encode as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Record a request if metrics are initialized, otherwise skip
pub fn try_record_request(emitter: &str, success: bool, events: usize) {
    if let Some(m) = Metrics::get() {
        m.record_request(emitter, success, events as u64);
    }
}

/// Adjust the buffered-events gauge if metrics are initialized
pub fn try_add_buffered(delta: i64) {
    if let Some(m) = Metrics::get() {
        m.add_buffered(delta as f64);
    }
}

/// Record a finished queue file if metrics are initialized
pub fn try_record_queue_file(result: &str) {
    if let Some(m) = Metrics::get() {
        m.record_queue_file(result);
    }
}
