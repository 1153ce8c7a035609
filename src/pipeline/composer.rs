//! Turns a definition string into a running dataflow.
//!
//! `compose` parses and resolves everything up front, so unknown stages and
//! malformed definitions fail before any task is spawned. `run` wires one
//! executor task per stage group with bounded channels, plus a source pump
//! and a supervisor. The supervisor joins the stage tasks in order and only
//! then closes the error sink, so the error stream ends right after the
//! result stream and never before an open window has been flushed.

use crate::config::{EngineConfig, PipelineConfig, WindowConfig, WindowOverride};
use crate::error::{PipeError, Result};
use crate::metrics::Metrics;
use crate::pipeline::batch_executor::BatchExecutor;
use crate::pipeline::context::{PipelineStats, PipelineSummary, StageContext};
use crate::pipeline::definition::{PipelineDefinition, StageGroup};
use crate::pipeline::error_sink::ErrorSink;
use crate::pipeline::item_executor::ItemExecutor;
use crate::pipeline::stage::{
    BatchStage, ItemStage, StageHandle, StageKind, StageRef, StageRegistry,
};
use crate::types::{ErrorRecord, Message};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Building,
    Running,
    /// The source has ended; stages are flushing what they hold
    Draining,
    Completed,
    /// Stopped through [`PipelineHandle::cancel`]; open windows were dropped
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Building => "building",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
enum ResolvedGroup {
    Items(Vec<ItemStage>),
    Batch(BatchStage, WindowConfig),
}

impl ResolvedGroup {
    fn label(&self) -> String {
        match self {
            Self::Items(stages) => stages
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join("+"),
            Self::Batch(stage, _) => stage.name().to_string(),
        }
    }
}

/// Builds [`Pipeline`]s against one stage registry.
pub struct PipelineComposer {
    registry: Arc<StageRegistry>,
    engine: EngineConfig,
    metrics: Option<Arc<Metrics>>,
}

impl PipelineComposer {
    pub fn new(registry: Arc<StageRegistry>, engine: EngineConfig) -> Self {
        Self {
            registry,
            engine,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build a pipeline from a bare definition such as `validate+enrich|match`.
    pub fn compose(&self, definition: &str) -> Result<Pipeline> {
        self.build(definition.trim(), definition, &BTreeMap::new())
    }

    /// Build a configured pipeline, applying its per-stage window overrides.
    pub fn compose_config(&self, config: &PipelineConfig) -> Result<Pipeline> {
        if !config.enabled {
            return Err(PipeError::InvalidConfig(format!(
                "pipeline '{}' is disabled",
                config.name
            )));
        }
        self.build(&config.name, &config.definition, &config.windows)
    }

    fn build(
        &self,
        name: &str,
        definition: &str,
        overrides: &BTreeMap<String, WindowOverride>,
    ) -> Result<Pipeline> {
        let definition = PipelineDefinition::parse(definition)?;

        let groups = definition
            .groups
            .iter()
            .map(|group| self.resolve_group(group, overrides))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Composed pipeline {} with {} stage groups: {}",
            name,
            groups.len(),
            definition
        );

        Ok(Pipeline {
            name: Arc::from(name),
            definition,
            groups,
            engine: self.engine.clone(),
            metrics: self.metrics.clone(),
        })
    }

    fn resolve_group(
        &self,
        group: &StageGroup,
        overrides: &BTreeMap<String, WindowOverride>,
    ) -> Result<ResolvedGroup> {
        let mut items = Vec::with_capacity(group.stages.len());

        for spec in &group.stages {
            match self.registry.resolve(&spec.name)? {
                StageHandle::Item(stage) => {
                    if spec.has_params() {
                        return Err(PipeError::invalid_definition(format!(
                            "'{}' is an item stage and takes no window parameters",
                            spec.name
                        )));
                    }
                    items.push(stage);
                }
                StageHandle::Batch(stage) => {
                    if group.is_fanout() {
                        return Err(PipeError::invalid_definition(format!(
                            "batch stage '{}' cannot be combined with '+'",
                            spec.name
                        )));
                    }

                    // inline > pipeline override > stage default > engine default
                    let mut window = stage.default_window().unwrap_or(self.engine.batch);
                    if let Some(pipeline_override) = overrides.get(&spec.name) {
                        window = pipeline_override.apply_to(window);
                    }
                    window = spec.window.apply_to(window);
                    window.validate(&format!("window of stage '{}'", spec.name))?;

                    debug!(
                        "Stage {} batches up to {} items or {:?}",
                        spec.name, window.max_size, window.max_time
                    );
                    return Ok(ResolvedGroup::Batch(stage, window));
                }
            }
        }

        Ok(ResolvedGroup::Items(items))
    }
}

/// A resolved, immutable pipeline. Each call to [`Pipeline::run`] starts an
/// independent instance over a new source.
#[derive(Clone)]
pub struct Pipeline {
    name: Arc<str>,
    definition: PipelineDefinition,
    groups: Vec<ResolvedGroup>,
    engine: EngineConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Resolved stages in definition order.
    pub fn stages(&self) -> Vec<StageRef> {
        self.groups
            .iter()
            .flat_map(|group| match group {
                ResolvedGroup::Items(stages) => stages
                    .iter()
                    .map(|s| StageRef {
                        name: s.name().to_string(),
                        kind: StageKind::Item,
                    })
                    .collect::<Vec<_>>(),
                ResolvedGroup::Batch(stage, _) => vec![StageRef {
                    name: stage.name().to_string(),
                    kind: StageKind::Batch,
                }],
            })
            .collect()
    }

    /// Effective window of a batch stage in this pipeline.
    pub fn window_for(&self, stage: &str) -> Option<WindowConfig> {
        self.groups.iter().find_map(|group| match group {
            ResolvedGroup::Batch(s, window) if s.name() == stage => Some(*window),
            _ => None,
        })
    }

    /// Start processing `source`. The result and error streams of the
    /// returned run should be read concurrently: both are bounded, and a
    /// stalled reader on either side eventually stalls the stages.
    pub fn run<S>(&self, source: S) -> PipelineRun
    where
        S: Stream<Item = Message> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(PipelineState::Building);
        let cancel = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());
        let (sink, errors) = ErrorSink::channel(self.engine.error_buffer);
        let capacity = self.engine.channel_capacity.max(1);

        let ctx = StageContext {
            pipeline: Arc::clone(&self.name),
            sink: sink.clone(),
            stats: Arc::clone(&stats),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
            terminal: false,
        };

        if let Some(metrics) = &self.metrics {
            metrics.active_pipelines.inc();
        }
        state_tx.send_replace(PipelineState::Running);
        info!("Pipeline {} ({}) running: {}", self.name, id, self.definition);

        let (source_tx, mut upstream) = mpsc::channel(capacity);
        let mut tasks = Vec::with_capacity(self.groups.len() + 1);
        tasks.push((
            "source".to_string(),
            tokio::spawn(pump_source(source, source_tx, ctx.clone(), state_tx.clone())),
        ));

        let last = self.groups.len().saturating_sub(1);
        for (index, group) in self.groups.iter().enumerate() {
            let (tx, rx) = mpsc::channel(capacity);
            let mut stage_ctx = ctx.clone();
            stage_ctx.terminal = index == last;
            let input = ReceiverStream::new(upstream);

            let handle = match group {
                ResolvedGroup::Items(stages) => {
                    ItemExecutor::new(stages.clone(), self.engine.item_concurrency, stage_ctx)
                        .spawn(input, tx)
                }
                ResolvedGroup::Batch(stage, window) => {
                    BatchExecutor::new(stage.clone(), *window, stage_ctx).spawn(input, tx)
                }
            };
            tasks.push((group.label(), handle));
            upstream = rx;
        }

        let supervisor = tokio::spawn(supervise(Supervision {
            pipeline: Arc::clone(&self.name),
            id,
            tasks,
            sink,
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
            state: state_tx,
            metrics: self.metrics.clone(),
        }));

        PipelineRun {
            results: ReceiverStream::new(upstream),
            errors,
            handle: PipelineHandle {
                name: Arc::clone(&self.name),
                id,
                state: state_rx,
                cancel,
                stats,
                supervisor,
            },
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("definition", &self.definition.to_string())
            .field("groups", &self.groups)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

/// The two output streams of a running pipeline and its control handle.
pub struct PipelineRun {
    pub results: ReceiverStream<Message>,
    pub errors: ReceiverStream<ErrorRecord>,
    pub handle: PipelineHandle,
}

impl PipelineRun {
    /// Drain both streams concurrently and wait for the pipeline to finish.
    pub async fn collect(self) -> Result<(Vec<Message>, Vec<ErrorRecord>, PipelineSummary)> {
        let PipelineRun {
            results,
            errors,
            handle,
        } = self;
        let (results, errors) = tokio::join!(
            results.collect::<Vec<_>>(),
            errors.collect::<Vec<_>>()
        );
        let summary = handle.wait().await?;
        Ok((results, errors, summary))
    }
}

pub struct PipelineHandle {
    name: Arc<str>,
    id: Uuid,
    state: watch::Receiver<PipelineState>,
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    supervisor: JoinHandle<Result<PipelineSummary>>,
}

impl PipelineHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Watch state transitions as they happen.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn stats(&self) -> PipelineSummary {
        self.stats.snapshot()
    }

    /// Stop every stage. Items in flight and open windows are dropped, not
    /// flushed; both output streams end.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this pipeline, for callers that keep only the
    /// token after handing the handle to [`PipelineHandle::wait`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<PipelineSummary> {
        self.supervisor.await?
    }
}

async fn pump_source<S>(
    source: S,
    output: mpsc::Sender<Message>,
    ctx: StageContext,
    state: watch::Sender<PipelineState>,
) where
    S: Stream<Item = Message> + Send + 'static,
{
    tokio::pin!(source);

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            next = source.next() => next,
        };
        let Some(message) = next else { break };

        ctx.stats.received.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &ctx.metrics {
            metrics.messages_in.with_label_values(&[&*ctx.pipeline]).inc();
        }

        let sent = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => false,
            result = output.send(message) => result.is_ok(),
        };
        if !sent {
            return;
        }
    }

    state.send_if_modified(|current| {
        if *current == PipelineState::Running {
            *current = PipelineState::Draining;
            true
        } else {
            false
        }
    });
    info!("Source of pipeline {} exhausted, draining", ctx.pipeline);
}

struct Supervision {
    pipeline: Arc<str>,
    id: Uuid,
    tasks: Vec<(String, JoinHandle<()>)>,
    sink: ErrorSink,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    state: watch::Sender<PipelineState>,
    metrics: Option<Arc<Metrics>>,
}

async fn supervise(run: Supervision) -> Result<PipelineSummary> {
    let mut failure = None;

    // Upstream first: a stage finishes only after its input has ended
    for (label, task) in run.tasks {
        if let Err(e) = task.await {
            error!(
                "Stage task {} of pipeline {} failed: {}",
                label, run.pipeline, e
            );
            run.cancel.cancel();
            failure.get_or_insert(PipeError::from(e));
        }
    }

    run.sink.close();

    let final_state = if run.cancel.is_cancelled() {
        PipelineState::Cancelled
    } else {
        PipelineState::Completed
    };
    run.state.send_replace(final_state);

    if let Some(metrics) = &run.metrics {
        metrics.active_pipelines.dec();
    }

    let summary = run.stats.snapshot();
    info!(
        "Pipeline {} ({}) {}: received={} emitted={} errored={} dropped={} windows={}",
        run.pipeline,
        run.id,
        final_state,
        summary.received,
        summary.emitted,
        summary.errored,
        summary.dropped,
        summary.windows_flushed
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}
