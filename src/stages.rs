//! Reference stages available to the `rustpipe` binary.
//!
//! Real deployments register their own implementations; these cover the
//! plumbing cases that need no business logic.

use crate::error::{Result, StageError};
use crate::pipeline::{BatchStage, Element, ItemStage, StageRegistry};
use crate::types::Payload;

/// Registry holding `noop`, `require_object`, `drop_null` and `collect`.
pub fn builtin_registry() -> Result<StageRegistry> {
    StageRegistry::new()
        .with(noop())?
        .with(require_object())?
        .with(drop_null())?
        .with(collect())
}

/// Passes every payload through unchanged.
pub fn noop() -> ItemStage {
    ItemStage::from_fn("noop", |payload| Ok(Some(payload)))
}

/// Rejects any payload that is not a JSON object.
pub fn require_object() -> ItemStage {
    ItemStage::from_fn("require_object", |payload: Payload| {
        if payload.is_object() {
            Ok(Some(payload))
        } else {
            Err(StageError::failed(format!(
                "expected a JSON object, got {}",
                json_kind(&payload)
            )))
        }
    })
}

/// Silently drops `null` payloads.
pub fn drop_null() -> ItemStage {
    ItemStage::from_fn("drop_null", |payload: Payload| {
        Ok((!payload.is_null()).then_some(payload))
    })
}

/// Batch identity: marks every element succeeded with its own input.
pub fn collect() -> BatchStage {
    BatchStage::from_fn("collect", |mut elements: Vec<Element>| {
        for element in elements.iter_mut() {
            let output = element.input().clone();
            element.succeed(output);
        }
        Ok(elements)
    })
}

fn json_kind(payload: &Payload) -> &'static str {
    match payload {
        Payload::Null => "null",
        Payload::Bool(_) => "boolean",
        Payload::Number(_) => "number",
        Payload::String(_) => "string",
        Payload::Array(_) => "array",
        Payload::Object(_) => "object",
    }
}
