//! Stage handles and the registry that resolves stage names.
//!
//! A stage is either an [`ItemStage`] (one payload in, at most one out) or a
//! [`BatchStage`] (a window of [`Element`]s in, the same elements marked
//! out). The registry is filled once at startup by whoever owns the stage
//! implementations; the engine only classifies what it finds there.

use crate::config::WindowConfig;
use crate::error::{PipeError, Result, StageResult};
use crate::pipeline::element::Element;
use crate::types::{Headers, Payload};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Single-item transformation.
#[async_trait]
pub trait ItemTransform: Send + Sync {
    /// `Ok(None)` means the stage produced nothing for this item.
    async fn apply(&self, payload: Payload) -> StageResult<Option<Payload>>;
}

/// Windowed transformation. Every returned element must be marked exactly
/// once and the output must be position-matched to the input.
#[async_trait]
pub trait BatchTransform: Send + Sync {
    async fn apply(&self, elements: Vec<Element>) -> StageResult<Vec<Element>>;
}

/// Optional capability: headers merged into every message a stage emits.
pub trait HeaderContributor: Send + Sync {
    fn headers_to_add(&self, payload: &Payload) -> Headers;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Item,
    Batch,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Item => write!(f, "item"),
            StageKind::Batch => write!(f, "batch"),
        }
    }
}

/// Resolved name and shape of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StageRef {
    pub name: String,
    pub kind: StageKind,
}

#[derive(Clone)]
pub struct ItemStage {
    name: Arc<str>,
    transform: Arc<dyn ItemTransform>,
    headers: Option<Arc<dyn HeaderContributor>>,
}

impl ItemStage {
    pub fn new(name: impl Into<Arc<str>>, transform: impl ItemTransform + 'static) -> Self {
        Self {
            name: name.into(),
            transform: Arc::new(transform),
            headers: None,
        }
    }

    pub fn from_fn<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(Payload) -> StageResult<Option<Payload>> + Send + Sync + 'static,
    {
        Self::new(name, SyncItemFn(f))
    }

    pub fn from_async_fn<F, Fut>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult<Option<Payload>>> + Send + 'static,
    {
        Self::new(name, AsyncItemFn(f))
    }

    pub fn with_headers(mut self, contributor: impl HeaderContributor + 'static) -> Self {
        self.headers = Some(Arc::new(contributor));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn transform(&self) -> &Arc<dyn ItemTransform> {
        &self.transform
    }

    pub(crate) fn contributed_headers(&self, payload: &Payload) -> Headers {
        self.headers
            .as_ref()
            .map(|c| c.headers_to_add(payload))
            .unwrap_or_default()
    }
}

impl fmt::Debug for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemStage")
            .field("name", &self.name)
            .field("header_aware", &self.headers.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct BatchStage {
    name: Arc<str>,
    transform: Arc<dyn BatchTransform>,
    headers: Option<Arc<dyn HeaderContributor>>,
    window: Option<WindowConfig>,
}

impl BatchStage {
    pub fn new(name: impl Into<Arc<str>>, transform: impl BatchTransform + 'static) -> Self {
        Self {
            name: name.into(),
            transform: Arc::new(transform),
            headers: None,
            window: None,
        }
    }

    pub fn from_fn<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(Vec<Element>) -> StageResult<Vec<Element>> + Send + Sync + 'static,
    {
        Self::new(name, SyncBatchFn(f))
    }

    pub fn from_async_fn<F, Fut>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(Vec<Element>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult<Vec<Element>>> + Send + 'static,
    {
        Self::new(name, AsyncBatchFn(f))
    }

    /// Window this stage prefers when the pipeline does not override it.
    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_headers(mut self, contributor: impl HeaderContributor + 'static) -> Self {
        self.headers = Some(Arc::new(contributor));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_window(&self) -> Option<WindowConfig> {
        self.window
    }

    pub(crate) fn transform(&self) -> &Arc<dyn BatchTransform> {
        &self.transform
    }

    pub(crate) fn contributed_headers(&self, payload: &Payload) -> Headers {
        self.headers
            .as_ref()
            .map(|c| c.headers_to_add(payload))
            .unwrap_or_default()
    }
}

impl fmt::Debug for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchStage")
            .field("name", &self.name)
            .field("header_aware", &self.headers.is_some())
            .field("window", &self.window)
            .finish()
    }
}

/// Tagged stage implementation as stored in the registry.
#[derive(Debug, Clone)]
pub enum StageHandle {
    Item(ItemStage),
    Batch(BatchStage),
}

impl StageHandle {
    pub fn name(&self) -> &str {
        match self {
            StageHandle::Item(s) => s.name(),
            StageHandle::Batch(s) => s.name(),
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            StageHandle::Item(_) => StageKind::Item,
            StageHandle::Batch(_) => StageKind::Batch,
        }
    }

    pub fn stage_ref(&self) -> StageRef {
        StageRef {
            name: self.name().to_string(),
            kind: self.kind(),
        }
    }
}

impl From<ItemStage> for StageHandle {
    fn from(stage: ItemStage) -> Self {
        StageHandle::Item(stage)
    }
}

impl From<BatchStage> for StageHandle {
    fn from(stage: BatchStage) -> Self {
        StageHandle::Batch(stage)
    }
}

/// Name to implementation mapping consulted while a pipeline is built.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, StageHandle>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
        }
    }

    pub fn register(&mut self, stage: impl Into<StageHandle>) -> Result<()> {
        let stage = stage.into();
        let name = stage.name().to_string();
        if self.stages.contains_key(&name) {
            return Err(PipeError::InvalidConfig(format!(
                "stage '{}' already registered",
                name
            )));
        }
        self.stages.insert(name, stage);
        Ok(())
    }

    /// Builder-style registration for startup code and tests.
    pub fn with(mut self, stage: impl Into<StageHandle>) -> Result<Self> {
        self.register(stage)?;
        Ok(self)
    }

    pub fn resolve(&self, name: &str) -> Result<StageHandle> {
        self.stages
            .get(name)
            .cloned()
            .ok_or_else(|| PipeError::UnknownStage {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

struct SyncItemFn<F>(F);

#[async_trait]
impl<F> ItemTransform for SyncItemFn<F>
where
    F: Fn(Payload) -> StageResult<Option<Payload>> + Send + Sync,
{
    async fn apply(&self, payload: Payload) -> StageResult<Option<Payload>> {
        (self.0)(payload)
    }
}

struct AsyncItemFn<F>(F);

#[async_trait]
impl<F, Fut> ItemTransform for AsyncItemFn<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = StageResult<Option<Payload>>> + Send,
{
    async fn apply(&self, payload: Payload) -> StageResult<Option<Payload>> {
        (self.0)(payload).await
    }
}

struct SyncBatchFn<F>(F);

#[async_trait]
impl<F> BatchTransform for SyncBatchFn<F>
where
    F: Fn(Vec<Element>) -> StageResult<Vec<Element>> + Send + Sync,
{
    async fn apply(&self, elements: Vec<Element>) -> StageResult<Vec<Element>> {
        (self.0)(elements)
    }
}

struct AsyncBatchFn<F>(F);

#[async_trait]
impl<F, Fut> BatchTransform for AsyncBatchFn<F>
where
    F: Fn(Vec<Element>) -> Fut + Send + Sync,
    Fut: Future<Output = StageResult<Vec<Element>>> + Send,
{
    async fn apply(&self, elements: Vec<Element>) -> StageResult<Vec<Element>> {
        (self.0)(elements).await
    }
}
