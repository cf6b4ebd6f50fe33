use std::time;

use thiserror::Error;

use crate::event::Stage;

/// Enumeration of reasons an event is refused at admission. Never queued, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("event payload is not a JSON object")]
    NotAnObject,
    #[error("event is missing required field: {0}")]
    MissingField(&'static str),
    #[error("event field {field} is malformed: {reason}")]
    MalformedField { field: &'static str, reason: String },
    #[error("failed to parse event: {0}")]
    Malformed(String),
}

/// Enumeration of admission failures of the priority queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue_full: {capacity} events already queued")]
    QueueFull { capacity: usize },
}

impl QueueError {
    /// Stable reason tag, used in logs and metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            QueueError::QueueFull { .. } => "queue_full",
        }
    }
}

/// Errors raised by external collaborators (cache, durable store, automation rules).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("collaborator rejected the request: {0}")]
    Rejected(String),
}

/// Failures that abort a pipeline run and are handed to the retry manager.
/// Only core-processing and storage produce these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("core-processing failed for {event_type} event: {reason}")]
    CoreProcessing { event_type: String, reason: String },
    #[error("storage failed: {0}")]
    Storage(#[from] CollaboratorError),
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            StageError::CoreProcessing { .. } => Stage::CoreProcessing,
            StageError::Storage(_) => Stage::Storage,
        }
    }
}

/// What a synchronous `submit` caller can get back.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("event rejected: {0}")]
    Validation(#[from] ValidationError),
    #[error("event dropped: {0}")]
    QueueFull(#[from] QueueError),
    #[error("event {processing_id} failed and was handed to retries: {error}")]
    Stage {
        processing_id: String,
        error: StageError,
    },
    #[error("pipeline is stopped")]
    Stopped,
}
