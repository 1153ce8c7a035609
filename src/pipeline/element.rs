use crate::error::StageError;
use crate::types::Payload;

/// What a batch stage decided for one element.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not marked yet. Returning a pending element violates the batch contract.
    Pending,
    Succeeded(Payload),
    Failed(StageError),
    /// Intentionally dropped: neither a result nor an error.
    Discarded,
}

/// Unit of work handed to a batch stage. One element is created per input
/// message entering a window and consumed once by the demultiplexer.
#[derive(Debug, Clone)]
pub struct Element {
    input: Payload,
    outcome: Outcome,
    marks: u32,
}

impl Element {
    pub fn new(input: Payload) -> Self {
        Self {
            input,
            outcome: Outcome::Pending,
            marks: 0,
        }
    }

    pub fn input(&self) -> &Payload {
        &self.input
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn succeed(&mut self, output: Payload) {
        self.mark(Outcome::Succeeded(output));
    }

    pub fn fail(&mut self, cause: StageError) {
        self.mark(Outcome::Failed(cause));
    }

    pub fn discard(&mut self) {
        self.mark(Outcome::Discarded);
    }

    pub fn output(&self) -> Option<&Payload> {
        match &self.outcome {
            Outcome::Succeeded(p) => Some(p),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StageError> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.outcome, Outcome::Pending)
    }

    /// Marked more than once; the batch contract allows exactly one mark.
    pub fn is_remarked(&self) -> bool {
        self.marks > 1
    }

    pub(crate) fn into_outcome(self) -> Outcome {
        self.outcome
    }

    fn mark(&mut self, outcome: Outcome) {
        self.marks = self.marks.saturating_add(1);
        self.outcome = outcome;
    }
}
