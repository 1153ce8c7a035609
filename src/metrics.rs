use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

pub struct Metrics {
    pub messages_in: IntCounterVec,
    pub messages_out: IntCounterVec,
    pub errors: IntCounterVec,
    pub windows_flushed: IntCounterVec,
    pub batch_latency: HistogramVec,
    pub active_pipelines: IntGauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> crate::Result<Arc<Self>> {
        let registry = Registry::new();

        let messages_in = IntCounterVec::new(
            Opts::new(
                "pipeline_messages_in_total",
                "Messages pulled from the pipeline source",
            ),
            &["pipeline"],
        )?;

        let messages_out = IntCounterVec::new(
            Opts::new(
                "pipeline_messages_out_total",
                "Messages written to the pipeline result stream",
            ),
            &["pipeline"],
        )?;

        let errors = IntCounterVec::new(
            Opts::new(
                "pipeline_errors_total",
                "Items diverted to the error stream",
            ),
            &["pipeline", "stage"],
        )?;

        let windows_flushed = IntCounterVec::new(
            Opts::new(
                "pipeline_windows_flushed_total",
                "Batch windows handed to a batch stage",
            ),
            &["pipeline", "stage"],
        )?;

        let batch_latency = HistogramVec::new(
            HistogramOpts::new(
                "pipeline_batch_latency_seconds",
                "Time spent inside one batch stage call",
            ),
            &["pipeline", "stage"],
        )?;

        let active_pipelines = IntGauge::new("pipeline_active", "Number of running pipelines")?;

        registry.register(Box::new(messages_in.clone()))?;
        registry.register(Box::new(messages_out.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(windows_flushed.clone()))?;
        registry.register(Box::new(batch_latency.clone()))?;
        registry.register(Box::new(active_pipelines.clone()))?;

        Ok(Arc::new(Self {
            messages_in,
            messages_out,
            errors,
            windows_flushed,
            batch_latency,
            active_pipelines,
            registry,
        }))
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn gather_text(&self) -> crate::Result<String> {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            crate::error::PipeError::Config(format!("metrics output is not UTF-8: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration_and_export() {
        let metrics = Metrics::new().unwrap();
        metrics.messages_in.with_label_values(&["orders"]).inc_by(3);
        metrics.errors.with_label_values(&["orders", "validate"]).inc();
        metrics.active_pipelines.inc();

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("pipeline_messages_in_total{pipeline=\"orders\"} 3"));
        assert!(text.contains("pipeline_errors_total{pipeline=\"orders\",stage=\"validate\"} 1"));
        assert!(text.contains("pipeline_active 1"));
    }
}
