use crate::error::StageError;
use crate::metrics::Metrics;
use crate::pipeline::error_sink::ErrorSink;
use crate::types::Message;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-pipeline counters, shared by every executor of one run.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub emitted: AtomicU64,
    pub errored: AtomicU64,
    pub dropped: AtomicU64,
    pub windows_flushed: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSummary {
        PipelineSummary {
            received: self.received.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            windows_flushed: self.windows_flushed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    /// Messages pulled from the source
    pub received: u64,
    /// Messages written to the result stream
    pub emitted: u64,
    /// Error records written to the error stream
    pub errored: u64,
    /// Items a stage chose not to forward
    pub dropped: u64,
    pub windows_flushed: u64,
}

/// Everything an executor shares with the rest of its pipeline.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub pipeline: Arc<str>,
    pub sink: ErrorSink,
    pub stats: Arc<PipelineStats>,
    pub metrics: Option<Arc<Metrics>>,
    pub cancel: CancellationToken,
    /// Set for the executor that writes the final result stream
    pub terminal: bool,
}

impl StageContext {
    pub(crate) async fn divert(&self, stage: &str, message: Message, cause: StageError) {
        self.stats.errored.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics
                .errors
                .with_label_values(&[&*self.pipeline, stage])
                .inc();
        }
        self.sink.send(stage, message, cause).await;
    }

    pub(crate) fn record_drop(&self) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Send `messages` downstream in order. Returns `false` once the
    /// pipeline is cancelled or the downstream reader is gone.
    pub(crate) async fn forward(
        &self,
        output: &mpsc::Sender<Message>,
        messages: Vec<Message>,
    ) -> bool {
        for message in messages {
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                result = output.send(message) => result.is_ok(),
            };
            if !sent {
                return false;
            }
            if self.terminal {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.messages_out.with_label_values(&[&*self.pipeline]).inc();
                }
            }
        }
        true
    }
}
