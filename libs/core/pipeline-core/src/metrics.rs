//! Prometheus metrics for the broker/store clients and worker runtime.
//!
//! Every health/worker module in this style of service ships metrics
//! alongside health endpoints (see `stream_worker::metrics`), and the
//! health surface's per-component detail is naturally backed by the same
//! counters this module exposes.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const MESSAGES_PROCESSED: &str = "pipeline_messages_processed_total";
    pub const MESSAGE_DURATION: &str = "pipeline_message_processing_duration_seconds";
    pub const RECONNECTS: &str = "pipeline_reconnects_total";
    pub const PUBLISH_FAILURES: &str = "pipeline_publish_failures_total";
    pub const IN_FLIGHT: &str = "pipeline_in_flight_messages";
}

#[derive(Debug, Clone, Copy)]
pub enum MessageOutcome {
    Acked,
    NackedRequeue,
    TimedOut,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::NackedRequeue => "nacked_requeue",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Initialize the Prometheus recorder. Call once at process startup; a
/// second call (common in tests) just returns the existing handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_message_outcome(queue: &str, outcome: MessageOutcome) {
    counter!(
        names::MESSAGES_PROCESSED,
        "queue" => queue.to_string(),
        "outcome" => outcome.as_str().to_string()
    )
    .increment(1);
}

pub fn record_message_duration(queue: &str, duration: Duration) {
    histogram!(
        names::MESSAGE_DURATION,
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_reconnect(component: &str) {
    counter!(
        names::RECONNECTS,
        "component" => component.to_string()
    )
    .increment(1);
}

pub fn record_publish_failure(routing_key: &str) {
    counter!(
        names::PUBLISH_FAILURES,
        "routing_key" => routing_key.to_string()
    )
    .increment(1);
}

pub fn set_in_flight(queue: &str, count: f64) {
    gauge!(
        names::IN_FLIGHT,
        "queue" => queue.to_string()
    )
    .set(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_outcome_as_str() {
        assert_eq!(MessageOutcome::Acked.as_str(), "acked");
        assert_eq!(MessageOutcome::NackedRequeue.as_str(), "nacked_requeue");
        assert_eq!(MessageOutcome::TimedOut.as_str(), "timed_out");
    }
}
