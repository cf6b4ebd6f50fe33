use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::event::Priority;
use crate::monitor::{MetricsSnapshot, PerformanceAlert};

/// Everything the pipeline tells the outside world about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PipelineSignal {
    EventProcessed {
        processing_id: String,
        event_type: String,
        priority: Priority,
        processed_at: DateTime<Utc>,
    },
    EventDeadLettered {
        processing_id: String,
        event_type: String,
        retry_count: u32,
        error: String,
    },
    MetricsUpdate(Box<MetricsSnapshot>),
    PerformanceAlert(PerformanceAlert),
}

/// Fan-out of `PipelineSignal`s to any number of subscribers.
///
/// Publishing never blocks and never fails: with no subscriber the signal is discarded, and a
/// subscriber that falls too far behind loses the oldest signals.
#[derive(Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<PipelineSignal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, signal: PipelineSignal) {
        drop(self.sender.send(signal));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineSignal> {
        self.sender.subscribe()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
