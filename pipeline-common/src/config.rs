use std::collections::HashMap;
use std::time;

use crate::event::Priority;

/// Event types known out of the box, with the priority they are queued at.
/// Anything not listed here is accepted with a warning and queued as medium.
const DEFAULT_EVENT_PRIORITIES: &[(&str, Priority)] = &[
    ("booking_complete", Priority::Critical),
    ("payment_failed", Priority::Critical),
    ("system_error", Priority::Critical),
    ("booking_start", Priority::High),
    ("payment_complete", Priority::High),
    ("user_registration", Priority::High),
    ("user_login", Priority::High),
    ("error", Priority::High),
    ("search", Priority::Medium),
    ("form_submit", Priority::Medium),
    ("api_call", Priority::Medium),
    ("page_view", Priority::Low),
    ("click", Priority::Low),
    ("scroll", Priority::Low),
];

pub fn default_event_priorities() -> HashMap<String, Priority> {
    DEFAULT_EVENT_PRIORITIES
        .iter()
        .map(|(event_type, priority)| ((*event_type).to_owned(), *priority))
        .collect()
}

/// Tunables of the event pipeline. Every threshold here is a heuristic default.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-event processing time the pipeline aims for. Slow events, bottlenecks and
    /// degraded health are all measured against it.
    pub processing_time_target: time::Duration,
    /// Maximum number of events drained per batch cycle.
    pub batch_size: usize,
    /// Ceiling on the sum of all four queue lengths.
    pub max_queue_size: usize,
    pub batch_interval: time::Duration,
    /// Cadence of the dedup expiry sweep, the retry sweep and the dead-letter purge.
    pub cleanup_interval: time::Duration,
    pub metrics_interval: time::Duration,
    /// Number of pipeline executions run concurrently inside a batch.
    pub concurrency: usize,
    /// Below this many queued events, eligible events skip the queues entirely.
    pub immediate_threshold: usize,
    /// Least urgent priority allowed to skip the queues when they are nearly empty.
    /// Critical events always skip them.
    pub idle_bypass_min_priority: Priority,
    pub max_retries: u32,
    pub retry_base_delay: time::Duration,
    pub retry_backoff_multiplier: u32,
    pub retry_max_delay: Option<time::Duration>,
    pub dead_letter_capacity: usize,
    pub dead_letter_retention: time::Duration,
    pub deduplication_window: time::Duration,
    pub enable_deduplication: bool,
    /// Timestamps further than this from wall-clock time are logged as skewed.
    pub clock_skew_tolerance: time::Duration,
    /// How many samples of per-stage and total timings to keep.
    pub stage_history_size: usize,
    pub slow_event_capacity: usize,
    pub bottleneck_capacity: usize,
    pub event_type_priorities: HashMap<String, Priority>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processing_time_target: time::Duration::from_millis(500),
            batch_size: 100,
            max_queue_size: 10_000,
            batch_interval: time::Duration::from_millis(100),
            cleanup_interval: time::Duration::from_secs(1),
            metrics_interval: time::Duration::from_secs(5),
            concurrency: 10,
            immediate_threshold: 10,
            idle_bypass_min_priority: Priority::Medium,
            max_retries: 3,
            retry_base_delay: time::Duration::from_millis(1000),
            retry_backoff_multiplier: 2,
            retry_max_delay: None,
            dead_letter_capacity: 1_000,
            dead_letter_retention: time::Duration::from_secs(60 * 60),
            deduplication_window: time::Duration::from_millis(5000),
            enable_deduplication: true,
            clock_skew_tolerance: time::Duration::from_secs(5 * 60),
            stage_history_size: 100,
            slow_event_capacity: 50,
            bottleneck_capacity: 20,
            event_type_priorities: default_event_priorities(),
        }
    }
}
