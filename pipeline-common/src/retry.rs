//! Retry list, backoff policy and dead-letter collection.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::event::QueuedEvent;
use crate::monitor::PerformanceMonitor;
use crate::signals::{PipelineSignal, SignalBus};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// The policy used to compute the delay before a failed event goes back to the queues.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past retry.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Delay before the retry that follows `previous_retries` earlier retries.
    /// The first retry waits `initial_interval`, every later one `backoff_coefficient` times
    /// longer than the one before, capped at `maximum_interval` if there is one.
    pub fn time_until_next_retry(&self, previous_retries: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .checked_mul(self.backoff_coefficient.saturating_pow(previous_retries))
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

/// An event parked on the retry list until `retry_at`.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub event: QueuedEvent,
    pub last_error: String,
    pub delay: time::Duration,
    pub retry_at: DateTime<Utc>,
}

/// Terminal record of an event that ran out of retries.
#[derive(Debug, Clone, Serialize)]
pub struct FailedEvent {
    pub processing_id: String,
    pub event_type: String,
    pub session_id: String,
    pub retry_count: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    #[serde(skip)]
    pub event: QueuedEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled {
        retry_count: u32,
        delay: time::Duration,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        retry_count: u32,
    },
}

/// Receives every failed pipeline run. Failed events wait on an internal retry list, not in
/// the priority queues, until their backoff elapses; `take_due` hands them back for
/// re-enqueueing. Events that exceed `max_retries` go to a bounded dead-letter collection,
/// the oldest entry making room for the newest.
pub struct RetryManager {
    policy: RetryPolicy,
    max_retries: u32,
    dead_letter_capacity: usize,
    dead_letter_retention: chrono::Duration,
    pending: Mutex<Vec<RetryEvent>>,
    dead_letters: Mutex<VecDeque<FailedEvent>>,
    monitor: Arc<PerformanceMonitor>,
    signals: SignalBus,
    clock: Arc<dyn Clock>,
}

impl RetryManager {
    pub fn new(
        config: &PipelineConfig,
        monitor: Arc<PerformanceMonitor>,
        signals: SignalBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy: RetryPolicy::new(
                config.retry_backoff_multiplier,
                config.retry_base_delay,
                config.retry_max_delay,
            ),
            max_retries: config.max_retries,
            dead_letter_capacity: config.dead_letter_capacity,
            dead_letter_retention: chrono::Duration::from_std(config.dead_letter_retention)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            pending: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            monitor,
            signals,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn pending_lock(&self) -> MutexGuard<'_, Vec<RetryEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dead_letters_lock(&self) -> MutexGuard<'_, VecDeque<FailedEvent>> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle a failed run of `event`: schedule another attempt, or dead-letter it once the
    /// retry ceiling is exceeded.
    pub fn on_failure(&self, mut event: QueuedEvent, failure: &StageError) -> RetryDecision {
        let now = self.clock.now();
        let previous_retries = event.retry_count;
        event.retry_count = previous_retries.saturating_add(1);
        let retry_count = event.retry_count;

        if retry_count > self.max_retries {
            error!(
                processing_id = %event.processing_id(),
                event_type = %event.event.event_type,
                retry_count,
                "retries exhausted, dead-lettering event: {}",
                failure
            );
            self.dead_letter(event, failure.to_string(), now);
            return RetryDecision::DeadLettered { retry_count };
        }

        let delay = self.policy.time_until_next_retry(previous_retries);
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or_else(|| now + chrono::Duration::days(36_500));

        info!(
            processing_id = %event.processing_id(),
            event_type = %event.event.event_type,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry: {}",
            failure
        );

        self.pending_lock().push(RetryEvent {
            event,
            last_error: failure.to_string(),
            delay,
            retry_at,
        });
        self.monitor.record_retry();

        RetryDecision::Scheduled {
            retry_count,
            delay,
            retry_at,
        }
    }

    fn dead_letter(&self, event: QueuedEvent, error: String, now: DateTime<Utc>) {
        self.signals.publish(PipelineSignal::EventDeadLettered {
            processing_id: event.event.processing_id.clone(),
            event_type: event.event.event_type.clone(),
            retry_count: event.retry_count,
            error: error.clone(),
        });
        self.monitor.record_dead_letter();

        if self.dead_letter_capacity == 0 {
            return;
        }

        let mut dead_letters = self.dead_letters_lock();
        while dead_letters.len() >= self.dead_letter_capacity {
            if let Some(evicted) = dead_letters.pop_front() {
                warn!(
                    processing_id = %evicted.processing_id,
                    capacity = self.dead_letter_capacity,
                    "dead-letter collection full, evicting oldest entry"
                );
            }
        }
        dead_letters.push_back(FailedEvent {
            processing_id: event.event.processing_id.clone(),
            event_type: event.event.event_type.clone(),
            session_id: event.event.session_id.clone(),
            retry_count: event.retry_count,
            error,
            failed_at: now,
            event,
        });
    }

    /// Remove every retry whose backoff has elapsed, earliest first. The returned events keep
    /// their retry count and are stamped as enqueued now.
    pub fn take_due(&self) -> Vec<QueuedEvent> {
        let now = self.clock.now();
        let mut due = {
            let mut pending = self.pending_lock();
            let (due, waiting): (Vec<RetryEvent>, Vec<RetryEvent>) =
                pending.drain(..).partition(|retry| retry.retry_at <= now);
            *pending = waiting;
            due
        };
        due.sort_by_key(|retry| retry.retry_at);

        due.into_iter()
            .map(|retry| QueuedEvent {
                enqueued_at: now,
                ..retry.event
            })
            .collect()
    }

    /// Drop dead letters older than the retention window. Returns how many were removed.
    pub fn purge_dead_letters(&self) -> usize {
        let cutoff = self.clock.now() - self.dead_letter_retention;
        let mut dead_letters = self.dead_letters_lock();
        let before = dead_letters.len();
        dead_letters.retain(|failed| failed.failed_at > cutoff);
        before - dead_letters.len()
    }

    pub fn pending(&self) -> Vec<RetryEvent> {
        self.pending_lock().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_lock().len()
    }

    pub fn dead_letters(&self) -> Vec<FailedEvent> {
        self.dead_letters_lock().iter().cloned().collect()
    }

    pub fn dead_letter_len(&self) -> usize {
        self.dead_letters_lock().len()
    }
}
