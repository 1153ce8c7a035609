//! Executor for a batch stage.
//!
//! Items are collected into a window that fires when it holds `max_size`
//! items or when `max_time` has passed since its first item arrived,
//! whichever comes first. Each window is handed to the stage once, as fresh
//! [`Element`]s, and the marked elements are split back into result
//! messages and error records carrying the original headers.

use crate::config::WindowConfig;
use crate::error::{StageError, StageResult};
use crate::pipeline::context::StageContext;
use crate::pipeline::element::{Element, Outcome};
use crate::pipeline::stage::BatchStage;
use crate::types::Message;
use futures::{FutureExt, Stream, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) struct BatchExecutor {
    stage: BatchStage,
    window: WindowConfig,
    ctx: StageContext,
}

struct OpenWindow {
    messages: Vec<Message>,
    deadline: Instant,
}

enum Trigger {
    Size,
    Time,
    Drain,
}

impl BatchExecutor {
    pub(crate) fn new(stage: BatchStage, window: WindowConfig, ctx: StageContext) -> Self {
        Self { stage, window, ctx }
    }

    pub(crate) fn spawn<S>(self, input: S, output: mpsc::Sender<Message>) -> JoinHandle<()>
    where
        S: Stream<Item = Message> + Send + 'static,
    {
        tokio::spawn(self.run(input, output))
    }

    async fn run<S>(self, input: S, output: mpsc::Sender<Message>)
    where
        S: Stream<Item = Message> + Send + 'static,
    {
        tokio::pin!(input);
        let mut open: Option<OpenWindow> = None;

        loop {
            let deadline = open.as_ref().map(|w| w.deadline);

            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    if let Some(window) = open.take() {
                        info!(
                            "Batch stage {} cancelled, dropping open window of {} items",
                            self.stage.name(),
                            window.messages.len()
                        );
                    }
                    return;
                }
                _ = wait_until(deadline) => {
                    if let Some(window) = open.take() {
                        if !self.flush_or_cancel(window.messages, &output, Trigger::Time).await {
                            return;
                        }
                    }
                }
                next = input.next() => match next {
                    Some(message) => {
                        let window = open.get_or_insert_with(|| OpenWindow {
                            messages: Vec::with_capacity(self.window.max_size),
                            deadline: Instant::now() + self.window.max_time,
                        });
                        window.messages.push(message);

                        if window.messages.len() >= self.window.max_size {
                            if let Some(full) = open.take() {
                                let flushed =
                                    self.flush_or_cancel(full.messages, &output, Trigger::Size);
                                if !flushed.await {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        if let Some(window) = open.take() {
                            self.flush_or_cancel(window.messages, &output, Trigger::Drain).await;
                        }
                        break;
                    }
                },
            }
        }

        debug!("Batch stage {} drained", self.stage.name());
    }

    /// Flush a window unless the pipeline is cancelled first. A slow batch
    /// call or a full error sink must not keep a cancelled stage alive.
    async fn flush_or_cancel(
        &self,
        messages: Vec<Message>,
        output: &mpsc::Sender<Message>,
        trigger: Trigger,
    ) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => {
                info!("Batch stage {} cancelled while flushing a window", self.stage.name());
                false
            }
            flushed = self.flush(messages, output, trigger) => flushed,
        }
    }

    /// Process one window and forward its results. Returns `false` when the
    /// downstream side is gone.
    async fn flush(
        &self,
        messages: Vec<Message>,
        output: &mpsc::Sender<Message>,
        trigger: Trigger,
    ) -> bool {
        let name = self.stage.name();
        let size = messages.len();
        debug!(
            "Batch stage {} flushing window of {} items ({})",
            name,
            size,
            match trigger {
                Trigger::Size => "size",
                Trigger::Time => "time",
                Trigger::Drain => "drain",
            }
        );

        let elements = messages
            .iter()
            .map(|m| Element::new(m.payload.clone()))
            .collect();

        let started = std::time::Instant::now();
        let result = match AssertUnwindSafe(self.stage.transform().apply(elements))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(StageError::from_panic(panic)),
        };

        self.ctx.stats.windows_flushed.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.ctx.metrics {
            let labels = [&*self.ctx.pipeline, name];
            metrics.windows_flushed.with_label_values(&labels).inc();
            metrics
                .batch_latency
                .with_label_values(&labels)
                .observe(started.elapsed().as_secs_f64());
        }

        let outcomes = match result.and_then(|elements| check_contract(elements, size)) {
            Ok(outcomes) => outcomes,
            Err(cause) => {
                if matches!(cause, StageError::BatchContractViolation(_)) {
                    error!("Batch stage {} broke its contract: {}", name, cause);
                } else {
                    warn!(
                        "Batch stage {} failed for a window of {} items: {}",
                        name, size, cause
                    );
                }
                for message in messages {
                    self.ctx.divert(name, message, cause.clone()).await;
                }
                return true;
            }
        };

        let mut emitted = Vec::with_capacity(size);
        for (message, outcome) in messages.into_iter().zip(outcomes) {
            match outcome {
                Outcome::Succeeded(payload) => {
                    let mut next = message.derive(payload);
                    next.headers
                        .merge_over(self.stage.contributed_headers(&next.payload));
                    emitted.push(next);
                }
                Outcome::Failed(cause) => {
                    self.ctx.divert(name, message, cause).await;
                }
                Outcome::Discarded => {
                    self.ctx.record_drop();
                }
                Outcome::Pending => {
                    // check_contract rejects pending elements
                    let cause = StageError::contract_violation("element left unmarked");
                    self.ctx.divert(name, message, cause).await;
                }
            }
        }

        self.ctx.forward(output, emitted).await
    }
}

/// Every element must come back, in place, marked exactly once.
fn check_contract(elements: Vec<Element>, expected: usize) -> StageResult<Vec<Outcome>> {
    if elements.len() != expected {
        return Err(StageError::contract_violation(format!(
            "stage returned {} elements for a window of {}",
            elements.len(),
            expected
        )));
    }

    if let Some(i) = elements.iter().position(Element::is_pending) {
        return Err(StageError::contract_violation(format!(
            "element {} left unmarked",
            i
        )));
    }

    if let Some(i) = elements.iter().position(Element::is_remarked) {
        return Err(StageError::contract_violation(format!(
            "element {} marked more than once",
            i
        )));
    }

    Ok(elements.into_iter().map(Element::into_outcome).collect())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
