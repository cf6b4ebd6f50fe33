use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::event::{PipelineOutcome, PipelineResult, Priority, Stage};
use crate::priority_queue::QueueDepths;
use crate::signals::{PipelineSignal, SignalBus};

const UNHEALTHY_ERROR_RATE: f64 = 0.10;
const DEGRADED_ERROR_RATE: f64 = 0.05;
const DEGRADED_QUEUE_UTILIZATION: f64 = 0.9;
const ALERT_QUEUE_UTILIZATION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowProcessing,
    QueueBacklog,
    HighErrorRate,
}

/// Advisory signal that a threshold was crossed. Nothing in the pipeline acts on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowEventSample {
    pub processing_id: String,
    pub event_type: String,
    pub total_ms: f64,
    pub slowest_stage: Option<Stage>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BottleneckSample {
    pub batch_size: usize,
    pub total_ms: f64,
    pub threshold_ms: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Sizes of everything that is waiting: the queues, the retry list and the dead letters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Backlog {
    pub queue_depths: QueueDepths,
    pub retry_pending: usize,
    pub dead_letters: usize,
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub average_processing_ms: f64,
    pub total_processing_ms: f64,
    /// Throughput over the last completed monitoring window.
    pub events_per_second: f64,
    /// `failed / (processed + failed)` over the last completed monitoring window.
    pub error_rate: f64,
    pub queue_depths: QueueDepths,
    pub queued_total: usize,
    pub queue_capacity: usize,
    pub retry_pending: usize,
    pub dead_letter_size: usize,
    pub stage_averages_ms: BTreeMap<Stage, f64>,
    pub slow_events: Vec<SlowEventSample>,
    pub bottlenecks: Vec<BottleneckSample>,
    pub health: HealthState,
    pub running: bool,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    processed: u64,
    failed: u64,
}

impl Window {
    fn starting(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            processed: 0,
            failed: 0,
        }
    }

    fn error_rate(&self) -> f64 {
        let attempts = self.processed + self.failed;
        if attempts == 0 {
            0.0
        } else {
            self.failed as f64 / attempts as f64
        }
    }

    fn events_per_second(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.started_at).to_std().unwrap_or_default();
        if elapsed.is_zero() {
            0.0
        } else {
            (self.processed + self.failed) as f64 / elapsed.as_secs_f64()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ClosedWindow {
    events_per_second: f64,
    error_rate: f64,
}

struct Stats {
    processed: u64,
    failed: u64,
    duplicates: u64,
    dropped: u64,
    retried: u64,
    dead_lettered: u64,
    total_processing: time::Duration,
    recent_totals: VecDeque<time::Duration>,
    stage_history: BTreeMap<Stage, VecDeque<time::Duration>>,
    slow_events: VecDeque<SlowEventSample>,
    bottlenecks: VecDeque<BottleneckSample>,
    window: Window,
    last_window: Option<ClosedWindow>,
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while buffer.len() >= capacity {
        drop(buffer.pop_front());
    }
    buffer.push_back(value);
}

fn mean_ms(samples: &VecDeque<time::Duration>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: time::Duration = samples.iter().sum();
    total.as_secs_f64() * 1000.0 / samples.len() as f64
}

/// Aggregates throughput, latency, backlog and error rate, derives the health state and
/// raises alerts.
///
/// All recording goes through one mutex-guarded aggregate, so the batch path and the
/// immediate path accumulate into the same numbers.
pub struct PerformanceMonitor {
    target: time::Duration,
    queue_capacity: usize,
    history_size: usize,
    slow_event_capacity: usize,
    bottleneck_capacity: usize,
    stats: Mutex<Stats>,
    running: AtomicBool,
    clock: Arc<dyn Clock>,
    signals: SignalBus,
}

impl PerformanceMonitor {
    pub fn new(config: &PipelineConfig, clock: Arc<dyn Clock>, signals: SignalBus) -> Self {
        let now = clock.now();
        Self {
            target: config.processing_time_target,
            queue_capacity: config.max_queue_size,
            history_size: config.stage_history_size,
            slow_event_capacity: config.slow_event_capacity,
            bottleneck_capacity: config.bottleneck_capacity,
            stats: Mutex::new(Stats {
                processed: 0,
                failed: 0,
                duplicates: 0,
                dropped: 0,
                retried: 0,
                dead_lettered: 0,
                total_processing: time::Duration::ZERO,
                recent_totals: VecDeque::new(),
                stage_history: BTreeMap::new(),
                slow_events: VecDeque::new(),
                bottlenecks: VecDeque::new(),
                window: Window::starting(now),
                last_window: None,
            }),
            running: AtomicBool::new(false),
            clock,
            signals,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fold one pipeline run into the aggregate.
    pub fn record_result(&self, result: &PipelineResult) {
        let outcome = result.outcome.as_str();
        counter!("pipeline_events_total", "outcome" => outcome).increment(1);
        histogram!("pipeline_processing_duration_seconds", "outcome" => outcome)
            .record(result.total.as_secs_f64());
        for (stage, elapsed) in &result.stage_timings {
            histogram!("pipeline_stage_duration_seconds", "stage" => stage.as_str())
                .record(elapsed.as_secs_f64());
        }

        let now = self.clock.now();
        let mut stats = self.lock();

        match result.outcome {
            PipelineOutcome::Processed => {
                stats.processed += 1;
                stats.window.processed += 1;
            }
            PipelineOutcome::Duplicate => stats.duplicates += 1,
            PipelineOutcome::Failed(_) => {
                stats.failed += 1;
                stats.window.failed += 1;
            }
        }

        stats.total_processing += result.total;
        push_bounded(&mut stats.recent_totals, result.total, self.history_size);
        for (stage, elapsed) in &result.stage_timings {
            let history = stats.stage_history.entry(*stage).or_default();
            push_bounded(history, *elapsed, self.history_size);
        }

        if result.total > self.target {
            let slowest_stage = result
                .stage_timings
                .iter()
                .max_by_key(|(_, elapsed)| **elapsed)
                .map(|(stage, _)| *stage);
            warn!(
                processing_id = %result.processing_id,
                event_type = %result.event_type,
                total_ms = result.total.as_millis() as u64,
                "slow event"
            );
            let sample = SlowEventSample {
                processing_id: result.processing_id.clone(),
                event_type: result.event_type.clone(),
                total_ms: result.total.as_secs_f64() * 1000.0,
                slowest_stage,
                recorded_at: now,
            };
            push_bounded(&mut stats.slow_events, sample, self.slow_event_capacity);
        }
    }

    pub fn record_dropped(&self, priority: Priority, reason: &'static str) {
        counter!(
            "pipeline_events_dropped_total",
            "priority" => priority.as_str(),
            "reason" => reason
        )
        .increment(1);
        self.lock().dropped += 1;
    }

    pub fn record_retry(&self) {
        counter!("pipeline_events_retried_total").increment(1);
        self.lock().retried += 1;
    }

    pub fn record_dead_letter(&self) {
        counter!("pipeline_events_dead_lettered_total").increment(1);
        self.lock().dead_lettered += 1;
    }

    pub fn record_queue_wait(&self, wait: time::Duration) {
        histogram!("pipeline_queue_wait_seconds").record(wait.as_secs_f64());
    }

    /// Record a batch cycle. Batches slower than twice the per-event target are kept as
    /// bottleneck samples.
    pub fn record_batch(&self, batch_size: usize, elapsed: time::Duration) {
        histogram!("pipeline_batch_size").record(batch_size as f64);
        histogram!("pipeline_batch_duration_seconds").record(elapsed.as_secs_f64());

        let threshold = self.target * 2;
        if elapsed <= threshold {
            return;
        }

        warn!(
            batch_size,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch processing bottleneck"
        );
        let sample = BottleneckSample {
            batch_size,
            total_ms: elapsed.as_secs_f64() * 1000.0,
            threshold_ms: threshold.as_secs_f64() * 1000.0,
            recorded_at: self.clock.now(),
        };
        let mut stats = self.lock();
        push_bounded(&mut stats.bottlenecks, sample, self.bottleneck_capacity);
    }

    fn window_rates(stats: &Stats, now: DateTime<Utc>) -> ClosedWindow {
        stats.last_window.unwrap_or_else(|| ClosedWindow {
            events_per_second: stats.window.events_per_second(now),
            error_rate: stats.window.error_rate(),
        })
    }

    /// Ordered checks, first match wins.
    fn evaluate(&self, average_ms: f64, error_rate: f64, queued: usize) -> HealthState {
        let target_ms = self.target.as_secs_f64() * 1000.0;
        let utilization = self.utilization(queued);

        if !self.is_running() || error_rate > UNHEALTHY_ERROR_RATE {
            HealthState::Unhealthy
        } else if average_ms > 2.0 * target_ms
            || utilization >= DEGRADED_QUEUE_UTILIZATION
            || error_rate > DEGRADED_ERROR_RATE
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn utilization(&self, queued: usize) -> f64 {
        if self.queue_capacity == 0 {
            1.0
        } else {
            queued as f64 / self.queue_capacity as f64
        }
    }

    pub fn health(&self, backlog: &Backlog) -> HealthState {
        let now = self.clock.now();
        let stats = self.lock();
        let rates = Self::window_rates(&stats, now);
        self.evaluate(
            mean_ms(&stats.recent_totals),
            rates.error_rate,
            backlog.queue_depths.total(),
        )
    }

    fn build_snapshot(
        &self,
        stats: &Stats,
        rates: ClosedWindow,
        backlog: &Backlog,
    ) -> MetricsSnapshot {
        let average_processing_ms = mean_ms(&stats.recent_totals);
        let queued_total = backlog.queue_depths.total();

        MetricsSnapshot {
            processed: stats.processed,
            failed: stats.failed,
            duplicates: stats.duplicates,
            dropped: stats.dropped,
            retried: stats.retried,
            dead_lettered: stats.dead_lettered,
            average_processing_ms,
            total_processing_ms: stats.total_processing.as_secs_f64() * 1000.0,
            events_per_second: rates.events_per_second,
            error_rate: rates.error_rate,
            queue_depths: backlog.queue_depths,
            queued_total,
            queue_capacity: self.queue_capacity,
            retry_pending: backlog.retry_pending,
            dead_letter_size: backlog.dead_letters,
            stage_averages_ms: stats
                .stage_history
                .iter()
                .map(|(stage, history)| (*stage, mean_ms(history)))
                .collect(),
            slow_events: stats.slow_events.iter().cloned().collect(),
            bottlenecks: stats.bottlenecks.iter().cloned().collect(),
            health: self.evaluate(average_processing_ms, rates.error_rate, queued_total),
            running: self.is_running(),
            taken_at: self.clock.now(),
        }
    }

    /// Current view, without closing the monitoring window.
    pub fn snapshot(&self, backlog: &Backlog) -> MetricsSnapshot {
        let now = self.clock.now();
        let stats = self.lock();
        let rates = Self::window_rates(&stats, now);
        self.build_snapshot(&stats, rates, backlog)
    }

    /// Close the current monitoring window, publish a `MetricsUpdate` and raise any alerts.
    /// Called once per metrics interval.
    pub fn sample(&self, backlog: &Backlog) -> MetricsSnapshot {
        let now = self.clock.now();
        let snapshot = {
            let mut stats = self.lock();
            let closed = ClosedWindow {
                events_per_second: stats.window.events_per_second(now),
                error_rate: stats.window.error_rate(),
            };
            stats.last_window = Some(closed);
            stats.window = Window::starting(now);
            self.build_snapshot(&stats, closed, backlog)
        };

        for priority in Priority::ALL {
            gauge!("pipeline_queue_depth", "priority" => priority.as_str())
                .set(snapshot.queue_depths.get(priority) as f64);
        }
        gauge!("pipeline_retry_pending").set(snapshot.retry_pending as f64);
        gauge!("pipeline_dead_letter_size").set(snapshot.dead_letter_size as f64);
        gauge!("pipeline_events_per_second").set(snapshot.events_per_second);
        gauge!("pipeline_error_rate").set(snapshot.error_rate);
        for state in [HealthState::Healthy, HealthState::Degraded, HealthState::Unhealthy] {
            let value = if snapshot.health == state { 1.0 } else { 0.0 };
            gauge!("pipeline_health_state", "state" => state.as_str()).set(value);
        }

        info!(
            processed = snapshot.processed,
            failed = snapshot.failed,
            dropped = snapshot.dropped,
            queued = snapshot.queued_total,
            events_per_second = snapshot.events_per_second,
            health = snapshot.health.as_str(),
            "pipeline metrics"
        );

        for alert in self.alerts(&snapshot) {
            warn!(
                kind = ?alert.kind,
                value = alert.value,
                threshold = alert.threshold,
                "{}",
                alert.message
            );
            self.signals.publish(PipelineSignal::PerformanceAlert(alert));
        }
        self.signals
            .publish(PipelineSignal::MetricsUpdate(Box::new(snapshot.clone())));

        snapshot
    }

    fn alerts(&self, snapshot: &MetricsSnapshot) -> Vec<PerformanceAlert> {
        let mut alerts = Vec::new();
        let target_ms = self.target.as_secs_f64() * 1000.0;

        if snapshot.average_processing_ms > target_ms {
            alerts.push(PerformanceAlert {
                kind: AlertKind::SlowProcessing,
                message: format!(
                    "average processing time {:.1}ms exceeds target {:.1}ms",
                    snapshot.average_processing_ms, target_ms
                ),
                value: snapshot.average_processing_ms,
                threshold: target_ms,
                raised_at: snapshot.taken_at,
            });
        }

        let backlog_limit = self.queue_capacity as f64 * ALERT_QUEUE_UTILIZATION;
        if snapshot.queued_total as f64 > backlog_limit {
            alerts.push(PerformanceAlert {
                kind: AlertKind::QueueBacklog,
                message: format!(
                    "{} events queued, above {:.0}% of capacity {}",
                    snapshot.queued_total,
                    ALERT_QUEUE_UTILIZATION * 100.0,
                    self.queue_capacity
                ),
                value: snapshot.queued_total as f64,
                threshold: backlog_limit,
                raised_at: snapshot.taken_at,
            });
        }

        if snapshot.error_rate > DEGRADED_ERROR_RATE {
            alerts.push(PerformanceAlert {
                kind: AlertKind::HighErrorRate,
                message: format!(
                    "error rate {:.1}% above {:.1}%",
                    snapshot.error_rate * 100.0,
                    DEGRADED_ERROR_RATE * 100.0
                ),
                value: snapshot.error_rate,
                threshold: DEGRADED_ERROR_RATE,
                raised_at: snapshot.taken_at,
            });
        }

        alerts
    }
}
