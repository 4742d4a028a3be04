//! Metric sampling behind a trait seam.
//!
//! The session loop only needs "give me the current metrics"; where they
//! come from is a deployment concern. The trait takes `&mut self` so real
//! samplers can keep counters for rate deltas between ticks.

use fleetd_core::envelope::body::TelemetryMetrics;

/// Supplies one [`TelemetryMetrics`] sample per telemetry tick.
pub trait TelemetrySource: Send {
    /// Samples current metrics.
    fn sample(&mut self) -> TelemetryMetrics;
}

/// Fixed-value source: reports the same metrics every tick.
///
/// This is the default wiring until a platform sampler lands.
// TODO: procfs-backed sampler (cpu/ram from /proc, net deltas per tick).
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetrySource {
    metrics: TelemetryMetrics,
}

impl StaticTelemetrySource {
    /// Source reporting all-zero metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Source reporting `metrics` on every tick.
    #[must_use]
    pub const fn with_metrics(metrics: TelemetryMetrics) -> Self {
        Self { metrics }
    }
}

impl TelemetrySource for StaticTelemetrySource {
    fn sample(&mut self) -> TelemetryMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_source_repeats_its_metrics() {
        let metrics = TelemetryMetrics {
            cpu: "12.5".to_string(),
            ram: "41.0".to_string(),
            disk_usage: "63.2".to_string(),
            network_rx: "1024".to_string(),
            network_tx: "2048".to_string(),
        };
        let mut source = StaticTelemetrySource::with_metrics(metrics.clone());
        assert_eq!(source.sample(), metrics);
        assert_eq!(source.sample(), metrics);
    }
}
