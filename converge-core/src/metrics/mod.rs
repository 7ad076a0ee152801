//! Metrics collection for observability
//!
//! Thin helpers over the `metrics` facade. The CLI mounts a Prometheus
//! exporter; the engine additionally keeps its own rolling counters for
//! the health surface.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Engine metrics
    describe_counter!("sync.events.total", "Total sync events accepted");
    describe_counter!("sync.events.completed", "Sync events applied successfully");
    describe_counter!("sync.events.failed", "Sync events that failed permanently");
    describe_counter!("sync.events.retried", "Retry attempts scheduled");
    describe_counter!("sync.conflicts.resolved", "Field conflicts resolved");
    describe_histogram!("sync.event.duration_ms", "End-to-end sync duration in milliseconds");

    // Queue metrics
    describe_counter!("queue.published", "Events published to the queue");
    describe_counter!("queue.consumed", "Events consumed from the queue");
    describe_counter!("queue.redelivered", "Events redelivered after visibility timeout");
    describe_gauge!("queue.depth", "Queued events across all streams");
    describe_gauge!("queue.in_flight", "Delivered but unacknowledged events");

    // Change log metrics
    describe_counter!("change_log.writes", "Change records written");
    describe_counter!("change_log.cleaned", "Terminal records removed by retention sweeps");
    describe_gauge!("change_log.size", "Change records currently stored");

    // Worker metrics
    describe_gauge!("workers.total", "Configured worker count");
    describe_gauge!("workers.active", "Workers currently processing an event");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();
        // Descriptions register globally; just ensure it doesn't panic.
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new("test.operation");
        std::thread::sleep(std::time::Duration::from_millis(5));
        timer.stop();
    }

    #[test]
    fn test_record_helpers() {
        record_counter("sync.events.total", 1);
        record_gauge("queue.depth", 3.0);
        record_histogram("sync.event.duration_ms", 12.5);
    }
}
