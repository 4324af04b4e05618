//! Tracker metrics
//!
//! Every tracker owns its own registry; nothing is registered globally, so
//! several trackers (one per checkout) can live in the same process.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Per-tracker counters and gauges
#[derive(Clone)]
pub struct TrackerMetrics {
    registry: Registry,

    // Counters
    pub events_tracked: IntCounter,
    pub events_dropped: IntCounter,
    pub events_oversized: IntCounter,
    pub events_sent: IntCounter,
    pub batches_sent: IntCounter,
    pub flush_failures: IntCounter,

    // Gauges
    pub events_queued: IntGauge,

    // Histograms
    pub request_latency: Histogram,
}

impl TrackerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events_tracked = IntCounter::with_opts(Opts::new(
            "events_tracked_total",
            "Events accepted into the queue",
        ))?;

        let events_dropped = IntCounter::with_opts(Opts::new(
            "events_dropped_total",
            "Events rejected at construction or after dispose",
        ))?;

        let events_oversized = IntCounter::with_opts(Opts::new(
            "events_oversized_total",
            "Events evicted for exceeding the batch size ceiling",
        ))?;

        let events_sent =
            IntCounter::with_opts(Opts::new("events_sent_total", "Events acknowledged by the collector"))?;

        let batches_sent =
            IntCounter::with_opts(Opts::new("batches_sent_total", "Batches acknowledged by the collector"))?;

        let flush_failures = IntCounter::with_opts(Opts::new(
            "flush_failures_total",
            "Batches rejected or not delivered",
        ))?;

        let events_queued =
            IntGauge::with_opts(Opts::new("events_queued", "Events waiting to be sent"))?;

        let request_latency = Histogram::with_opts(
            HistogramOpts::new("collector_request_seconds", "Collector request latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        registry.register(Box::new(events_tracked.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(events_oversized.clone()))?;
        registry.register(Box::new(events_sent.clone()))?;
        registry.register(Box::new(batches_sent.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(events_queued.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;

        Ok(Self {
            registry,
            events_tracked,
            events_dropped,
            events_oversized,
            events_sent,
            batches_sent,
            flush_failures,
            events_queued,
            request_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric in this registry
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::debug!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl std::fmt::Debug for TrackerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerMetrics")
            .field("events_tracked", &self.events_tracked.get())
            .field("events_sent", &self.events_sent.get())
            .field("events_queued", &self.events_queued.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = TrackerMetrics::new().unwrap();
        let b = TrackerMetrics::new().unwrap();

        a.events_tracked.inc();
        assert_eq!(a.events_tracked.get(), 1);
        assert_eq!(b.events_tracked.get(), 0);
    }

    #[test]
    fn test_text_export_names() {
        let metrics = TrackerMetrics::new().unwrap();
        metrics.events_sent.inc_by(3);
        metrics.events_queued.set(2);

        let text = metrics.encode_text();
        assert!(text.contains("events_sent_total 3"));
        assert!(text.contains("events_queued 2"));
        assert!(text.contains("flush_failures_total 0"));
    }
}
