use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipeError>;

/// Result type returned by stage implementations.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Engine-level failures. Build-time variants (`UnknownStage`,
/// `InvalidDefinition`) are fatal: a pipeline that fails with them never runs.
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown stage '{name}', available: [{}]", available.join(", "))]
    UnknownStage {
        name: String,
        available: Vec<String>,
    },

    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Stage task failed: {0}")]
    Task(String),
}

impl PipeError {
    pub fn invalid_definition(msg: impl Into<String>) -> Self {
        Self::InvalidDefinition(msg.into())
    }

    /// True for failures that abort pipeline construction.
    pub fn is_build_failure(&self) -> bool {
        matches!(
            self,
            Self::UnknownStage { .. } | Self::InvalidDefinition(_) | Self::InvalidConfig(_)
        )
    }
}

impl From<tokio::task::JoinError> for PipeError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

/// Cause attached to an item that was diverted to the error sink.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum StageError {
    /// The stage rejected this item (or this element of a batch).
    #[error("stage failed: {0}")]
    Failed(String),

    /// The batch call itself failed; every element of the window carries this.
    #[error("batch failed: {0}")]
    BatchFailed(String),

    /// The batch stage returned elements that break the marking contract.
    #[error("batch contract violation: {0}")]
    BatchContractViolation(String),

    #[error("stage panicked: {0}")]
    Panicked(String),
}

impl StageError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn batch_failed(msg: impl Into<String>) -> Self {
        Self::BatchFailed(msg.into())
    }

    pub fn contract_violation(msg: impl Into<String>) -> Self {
        Self::BatchContractViolation(msg.into())
    }

    pub(crate) fn from_panic(panic: Box<dyn std::any::Any + Send>) -> Self {
        let reason = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_stage_lists_available() {
        let err = PipeError::UnknownStage {
            name: "enrich".to_string(),
            available: vec!["match".to_string(), "validate".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown stage 'enrich', available: [match, validate]"
        );
        assert!(err.is_build_failure());
        assert!(!PipeError::Task("join".to_string()).is_build_failure());
    }

    #[test]
    fn test_stage_error_serializes_with_kind() {
        let json = serde_json::to_value(StageError::failed("bad field")).unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["reason"], "bad field");
    }

    #[test]
    fn test_panic_payload_extraction() {
        let err = StageError::from_panic(Box::new("boom"));
        assert_eq!(err, StageError::Panicked("boom".to_string()));

        let err = StageError::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err, StageError::Panicked("owned boom".to_string()));

        let err = StageError::from_panic(Box::new(42u32));
        assert_eq!(err, StageError::Panicked("unknown panic payload".to_string()));
    }
}
