use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::StageError;

/// Enumeration of event priorities, declared in drain order: critical events leave the
/// queues first, low priority events last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// All priorities, in drain order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// True when `self` is at least as urgent as `floor`.
    pub fn at_least(self, floor: Priority) -> bool {
        self <= floor
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePriorityError(pub String);

impl fmt::Display for ParsePriorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a valid Priority", self.0)
    }
}

impl std::error::Error for ParsePriorityError {}

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            invalid => Err(ParsePriorityError(invalid.to_owned())),
        }
    }
}

/// An event as submitted by a caller. Nothing is guaranteed about it until it goes through
/// the `Validator`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(rename = "type", alias = "eventType", alias = "event_type")]
    pub event_type: Option<String>,
    /// Either an RFC 3339 string or milliseconds since the epoch.
    pub timestamp: Option<Value>,
    #[serde(alias = "session_id")]
    pub session_id: Option<String>,
    /// Numeric identifiers are accepted and kept as their decimal string.
    #[serde(alias = "user_id", default, deserialize_with = "user_id_from_string_or_number")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub data: Map<String, Value>,
}

fn user_id_from_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "userId must be a string or a number, got {other}"
        ))),
    }
}

fn null_as_empty_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// An admitted event, carrying its processing identifier and resolved priority.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedEvent {
    pub processing_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_id: Option<String>,
    pub data: Map<String, Value>,
    pub priority: Priority,
    pub validated_at: DateTime<Utc>,
}

/// A ValidatedEvent waiting in (or just drained from) a priority queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub event: ValidatedEvent,
    pub enqueued_at: DateTime<Utc>,
    /// How many times this event already failed and was retried.
    pub retry_count: u32,
}

impl QueuedEvent {
    pub fn new(event: ValidatedEvent, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            event,
            enqueued_at,
            retry_count: 0,
        }
    }

    pub fn priority(&self) -> Priority {
        self.event.priority
    }

    pub fn processing_id(&self) -> &str {
        &self.event.processing_id
    }

    /// Time spent queued, as seen at `now`.
    pub fn queue_wait(&self, now: DateTime<Utc>) -> Duration {
        (now - self.enqueued_at).to_std().unwrap_or_default()
    }
}

/// The record handed to the durable store once core-processing is done.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedEvent {
    pub processing_id: String,
    pub event_type: String,
    pub priority: Priority,
    pub session_id: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub data: Map<String, Value>,
    /// Context attached by the enrichment stage, if any was available.
    pub context: Map<String, Value>,
    /// Event-type-specific sub-records extracted by the registered handler.
    pub details: Map<String, Value>,
}

/// Named steps of the pipeline, declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Enrichment,
    DeduplicationCheck,
    CoreProcessing,
    Storage,
    CacheUpdate,
    AutomationTrigger,
    Notification,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Enrichment,
        Stage::DeduplicationCheck,
        Stage::CoreProcessing,
        Stage::Storage,
        Stage::CacheUpdate,
        Stage::AutomationTrigger,
        Stage::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Enrichment => "enrichment",
            Stage::DeduplicationCheck => "deduplication-check",
            Stage::CoreProcessing => "core-processing",
            Stage::Storage => "storage",
            Stage::CacheUpdate => "cache-update",
            Stage::AutomationTrigger => "automation-trigger",
            Stage::Notification => "notification",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Processed,
    Duplicate,
    Failed(StageError),
}

impl PipelineOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineOutcome::Processed => "processed",
            PipelineOutcome::Duplicate => "duplicate",
            PipelineOutcome::Failed(_) => "failed",
        }
    }
}

/// Outcome of running one event through the pipeline, with per-stage timings.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub processing_id: String,
    pub event_type: String,
    pub outcome: PipelineOutcome,
    pub stage_timings: BTreeMap<Stage, Duration>,
    pub total: Duration,
}

impl PipelineResult {
    pub fn is_processed(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Processed)
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Duplicate)
    }

    pub fn error(&self) -> Option<&StageError> {
        match &self.outcome {
            PipelineOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}
