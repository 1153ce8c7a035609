pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod stages;
pub mod types;

pub use config::Config;
pub use error::{PipeError, Result, StageError, StageResult};
pub use pipeline::{PipelineComposer, PipelineState, StageRegistry};
pub use types::{ErrorRecord, Header, Headers, Message, Payload};
