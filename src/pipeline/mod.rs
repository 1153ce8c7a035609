//! Pipeline composition and stage execution.
//!
//! A definition such as `validate+enrich|match(size=50,time=2s)` is parsed
//! into groups separated by `|`. Each group runs in its own executor task:
//!
//! - **Item groups** apply one stage, or several combined with `+`, to every
//!   message. Each `+` branch gets its own copy of the payload and fails on
//!   its own.
//! - **Batch groups** collect messages into windows bounded by count and
//!   time and hand each window to the stage as marked [`Element`]s.
//!
//! Every executor writes failures to one shared [`ErrorSink`]. The resulting
//! error stream ends right after the result stream does.

mod batch_executor;
pub mod composer;
mod context;
pub mod definition;
pub mod element;
pub mod error_sink;
mod item_executor;
pub mod stage;


pub use composer::{Pipeline, PipelineComposer, PipelineHandle, PipelineRun, PipelineState};
pub use context::{PipelineStats, PipelineSummary};
pub use definition::{PipelineDefinition, StageGroup, StageSpec};
pub use element::{Element, Outcome};
pub use error_sink::ErrorSink;
pub use stage::{
    BatchStage, BatchTransform, HeaderContributor, ItemStage, ItemTransform, StageHandle,
    StageKind, StageRef, StageRegistry,
};
