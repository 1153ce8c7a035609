//! Executor for item stages, alone or combined into a `+` fan-out group.
//!
//! Up to `concurrency` items are in flight at once, but outputs leave in
//! input order: every branch of item *i* is emitted before anything of item
//! *i+1*. A failure is isolated to the stage (or branch) that raised it.

use crate::error::{StageError, StageResult};
use crate::pipeline::context::StageContext;
use crate::pipeline::stage::ItemStage;
use crate::types::{Message, Payload};
use futures::future::join_all;
use futures::{FutureExt, Stream, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub(crate) struct ItemExecutor {
    stages: Vec<ItemStage>,
    concurrency: usize,
    ctx: StageContext,
}

impl ItemExecutor {
    pub(crate) fn new(stages: Vec<ItemStage>, concurrency: usize, ctx: StageContext) -> Self {
        Self {
            stages,
            concurrency: concurrency.max(1),
            ctx,
        }
    }

    pub(crate) fn label(&self) -> String {
        self.stages
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join("+")
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
        let label = self.label();
        let executor = Arc::new(self);
        let ctx = executor.ctx.clone();
        let concurrency = executor.concurrency;

        let worker = Arc::clone(&executor);
        let outputs = input
            .map(move |message| {
                let worker = Arc::clone(&worker);
                async move { worker.process(message).await }
            })
            .buffered(concurrency);
        tokio::pin!(outputs);

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    info!("Item stage {} cancelled", label);
                    return;
                }
                next = outputs.next() => next,
            };

            match next {
                Some(messages) => {
                    if !ctx.forward(&output, messages).await {
                        debug!("Item stage {} stopped: downstream closed or cancelled", label);
                        return;
                    }
                }
                None => break,
            }
        }

        debug!("Item stage {} drained", label);
    }

    /// Run every stage of the group against one message and collect the
    /// messages to emit, in stage order.
    pub(crate) async fn process(&self, message: Message) -> Vec<Message> {
        if let [stage] = self.stages.as_slice() {
            let result = invoke(stage, message.payload.clone()).await;
            return self
                .settle(stage, &message, result)
                .await
                .into_iter()
                .collect();
        }

        // Each branch works on its own deep copy of the payload
        let results = join_all(
            self.stages
                .iter()
                .map(|stage| invoke(stage, message.payload.clone())),
        )
        .await;

        let mut emitted = Vec::with_capacity(self.stages.len());
        for (stage, result) in self.stages.iter().zip(results) {
            if let Some(out) = self.settle(stage, &message, result).await {
                emitted.push(out);
            }
        }
        emitted
    }

    async fn settle(
        &self,
        stage: &ItemStage,
        original: &Message,
        result: StageResult<Option<Payload>>,
    ) -> Option<Message> {
        match result {
            Ok(Some(payload)) => {
                let mut next = original.derive(payload);
                next.headers.merge_over(stage.contributed_headers(&next.payload));
                Some(next)
            }
            Ok(None) => {
                debug!("Stage {} produced no output for item", stage.name());
                self.ctx.record_drop();
                None
            }
            Err(cause) => {
                self.ctx.divert(stage.name(), original.clone(), cause).await;
                None
            }
        }
    }
}

async fn invoke(stage: &ItemStage, payload: Payload) -> StageResult<Option<Payload>> {
    match AssertUnwindSafe(stage.transform().apply(payload))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(StageError::from_panic(panic)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::PipelineStats;
    use crate::pipeline::error_sink::ErrorSink;
    use crate::pipeline::stage::HeaderContributor;
    use crate::types::Headers;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_util::sync::CancellationToken;

    fn context(sink: ErrorSink) -> StageContext {
        StageContext {
            pipeline: Arc::from("test"),
            sink,
            stats: Arc::new(PipelineStats::default()),
            metrics: None,
            cancel: CancellationToken::new(),
            terminal: true,
        }
    }

    fn prefix(name: &'static str) -> ItemStage {
        ItemStage::from_fn(name, move |p| {
            let text = p.as_str().unwrap_or_default();
            Ok(Some(json!(format!("{}: {}", name, text))))
        })
    }

    fn failing(name: &'static str) -> ItemStage {
        ItemStage::from_fn(name, |_| Err(StageError::failed("rejected")))
    }

    struct Source;

    impl HeaderContributor for Source {
        fn headers_to_add(&self, payload: &Payload) -> Headers {
            Headers::new().with("source", payload.as_str().unwrap_or("?"))
        }
    }

    #[tokio::test]
    async fn test_single_stage_success_keeps_headers() {
        let (sink, _errors) = ErrorSink::channel(8);
        let executor = ItemExecutor::new(vec![prefix("A")], 1, context(sink));

        let message = Message::new(json!("T0"))
            .with_key("k")
            .with_headers(Headers::new().with("trace", "1"));
        let out = executor.process(message).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, json!("A: T0"));
        assert_eq!(out[0].headers.get_str("trace"), Some("1"));
        assert_eq!(out[0].key.as_deref(), Some(&b"k"[..]));
    }

    #[tokio::test]
    async fn test_single_stage_failure_routes_original() {
        let (sink, mut errors) = ErrorSink::channel(8);
        let ctx = context(sink.clone());
        let stats = Arc::clone(&ctx.stats);
        let executor = ItemExecutor::new(vec![failing("V")], 1, ctx);

        let message = Message::new(json!({"id": 7})).with_headers(Headers::new().with("h", "v"));
        assert!(executor.process(message.clone()).await.is_empty());

        sink.close();
        let record = errors.next().await.unwrap();
        assert_eq!(record.stage, "V");
        assert_eq!(record.message, message);
        assert_eq!(record.cause, StageError::failed("rejected"));
        assert_eq!(stats.errored.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_fanout_isolates_branch_failures() {
        let (sink, mut errors) = ErrorSink::channel(8);
        let dropper = ItemStage::from_fn("C", |_| Ok(None));
        let stages = vec![prefix("A"), failing("B"), dropper];
        let executor = ItemExecutor::new(stages, 4, context(sink.clone()));

        let out = executor.process(Message::new(json!("T1"))).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, json!("A: T1"));

        sink.close();
        let records: Vec<_> = errors.collect().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "B");
        assert_eq!(records[0].message.payload, json!("T1"));
    }

    #[tokio::test]
    async fn test_fanout_branches_get_independent_copies() {
        let (sink, _errors) = ErrorSink::channel(8);
        let mutate = ItemStage::from_fn("mutate", |mut p| {
            p["touched"] = json!(true);
            Ok(Some(p))
        });
        let observe = ItemStage::from_fn("observe", |p| Ok(Some(p)));
        let executor = ItemExecutor::new(vec![mutate, observe], 2, context(sink));

        let out = executor.process(Message::new(json!({"id": 1}))).await;
        assert_eq!(out[0].payload, json!({"id": 1, "touched": true}));
        assert_eq!(out[1].payload, json!({"id": 1}));
    }

    #[tokio::test]
    async fn test_header_contribution_per_branch() {
        let (sink, _errors) = ErrorSink::channel(8);
        let tagged = prefix("A").with_headers(Source);
        let executor = ItemExecutor::new(vec![tagged, prefix("B")], 2, context(sink));

        let message =
            Message::new(json!("x")).with_headers(Headers::new().with("source", "upstream"));
        let out = executor.process(message).await;

        assert_eq!(out[0].headers.get_str("source"), Some("A: x"));
        assert_eq!(out[1].headers.get_str("source"), Some("upstream"));
    }

    #[tokio::test]
    async fn test_panicking_stage_is_contained() {
        let (sink, mut errors) = ErrorSink::channel(8);
        let boom = ItemStage::from_fn("boom", |_| panic!("stage exploded"));
        let executor = ItemExecutor::new(vec![boom, prefix("ok")], 2, context(sink.clone()));

        let out = executor.process(Message::new(json!("T"))).await;
        assert_eq!(out.len(), 1);

        sink.close();
        let record = errors.next().await.unwrap();
        assert_eq!(record.cause, StageError::Panicked("stage exploded".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_processing_preserves_order() {
        let (sink, _errors) = ErrorSink::channel(8);
        // Earlier items take longer, so completion order is reversed
        let slow = ItemStage::from_async_fn("slow", |p: Payload| async move {
            let n = p.as_u64().unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(100 - n * 10)).await;
            Ok::<_, StageError>(Some(p))
        });
        let executor = ItemExecutor::new(vec![slow], 8, context(sink));

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let handle = executor.spawn(ReceiverStream::new(in_rx), out_tx);

        for i in 0..8u64 {
            in_tx.send(Message::new(json!(i))).await.unwrap();
        }
        drop(in_tx);

        let out: Vec<_> = ReceiverStream::new(out_rx).map(|m| m.payload).collect().await;
        handle.await.unwrap();
        assert_eq!(out, (0..8u64).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancel_stops_executor() {
        let (sink, _errors) = ErrorSink::channel(8);
        let ctx = context(sink);
        let cancel = ctx.cancel.clone();
        let executor = ItemExecutor::new(vec![prefix("A")], 1, ctx);

        let (_in_tx, in_rx) = mpsc::channel::<Message>(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let handle = executor.spawn(ReceiverStream::new(in_rx), out_tx);

        cancel.cancel();
        handle.await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}
