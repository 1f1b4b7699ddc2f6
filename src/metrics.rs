use crate::telemetry::{runtime_counters, RuntimeCounters};
use std::sync::OnceLock;

pub use crate::telemetry::{
    DestinationOutcomeSnapshot, QueueDepthSnapshot, RuntimeCountersSnapshot,
};

/// Collector that wraps the runtime counter APIs with a single entrypoint.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn snapshot(&self) -> crate::telemetry::RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn inc_messages_received(&self) {
        self.counters.inc_messages_received();
    }

    pub fn inc_source_filtered(&self) {
        self.counters.inc_source_filtered();
    }

    pub fn inc_source_errors(&self) {
        self.counters.inc_source_errors();
    }

    pub fn inc_batches_split(&self) {
        self.counters.inc_batches_split();
    }

    pub fn inc_responses_timed_out(&self) {
        self.counters.inc_responses_timed_out();
    }

    pub fn record_queue_replayed(&self, items: u64) {
        self.counters.record_queue_replayed(items);
    }

    pub fn record_destination_sent(&self, channel: &str, destination: &str) {
        self.counters.record_destination_sent(channel, destination);
    }

    pub fn record_destination_queued(&self, channel: &str, destination: &str) {
        self.counters.record_destination_queued(channel, destination);
    }

    pub fn record_destination_filtered(&self, channel: &str, destination: &str) {
        self.counters.record_destination_filtered(channel, destination);
    }

    pub fn record_destination_error(&self, channel: &str, destination: &str, reason: Option<&str>) {
        self.counters
            .record_destination_error(channel, destination, reason);
    }

    pub fn set_queue_depth(&self, channel: &str, destination: &str, depth: u64) {
        self.counters.set_queue_depth(channel, destination, depth);
    }
}

/// Returns the shared `MetricsCollector` instance.
pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}
