//! `EventPipeline` wires the components together and owns the periodic tasks.
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::Collaborators;
use crate::config::PipelineConfig;
use crate::dedup::DeduplicationCache;
use crate::error::PipelineError;
use crate::event::{PipelineResult, Priority, QueuedEvent};
use crate::handlers::HandlerRegistry;
use crate::monitor::{Backlog, HealthState, MetricsSnapshot, PerformanceMonitor};
use crate::pipeline::PipelineExecutor;
use crate::priority_queue::PriorityQueueManager;
use crate::retry::{FailedEvent, RetryManager};
use crate::scheduler::{BatchReport, BatchScheduler};
use crate::signals::{PipelineSignal, SignalBus};
use crate::validation::Validator;

/// How `submit` admitted an event.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Ran right away, bypassing the queues.
    Processed(PipelineResult),
    /// Waiting in the queue for its priority.
    Queued {
        processing_id: String,
        priority: Priority,
    },
}

impl Admission {
    pub fn processing_id(&self) -> &str {
        match self {
            Admission::Processed(result) => &result.processing_id,
            Admission::Queued { processing_id, .. } => processing_id,
        }
    }
}

/// What one cleanup tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_keys: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub purged_dead_letters: usize,
}

struct RunningTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct EventPipelineBuilder {
    config: PipelineConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    handlers: HandlerRegistry,
    shared_deduplication: bool,
}

impl EventPipelineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Also record deduplication keys in the collaborator cache, so that every instance using
    /// the same cache sees the same duplicates.
    pub fn shared_deduplication(mut self, enabled: bool) -> Self {
        self.shared_deduplication = enabled;
        self
    }

    pub fn build(self) -> EventPipeline {
        let config = self.config;
        let clock = self.clock;
        let signals = SignalBus::default();

        let monitor = Arc::new(PerformanceMonitor::new(
            &config,
            clock.clone(),
            signals.clone(),
        ));
        let queues = Arc::new(PriorityQueueManager::new(config.max_queue_size));

        let mut dedup = DeduplicationCache::new(config.deduplication_window, clock.clone());
        if self.shared_deduplication {
            dedup = dedup.with_shared_store(self.collaborators.cache.clone());
        }
        let dedup = Arc::new(dedup);

        let retries = Arc::new(RetryManager::new(
            &config,
            monitor.clone(),
            signals.clone(),
            clock.clone(),
        ));
        let executor = Arc::new(PipelineExecutor::new(
            self.handlers,
            dedup.clone(),
            config.enable_deduplication,
            self.collaborators,
            monitor.clone(),
            signals.clone(),
            clock.clone(),
        ));
        let scheduler = BatchScheduler::new(
            config.batch_size,
            config.concurrency,
            queues.clone(),
            executor.clone(),
            retries.clone(),
            monitor.clone(),
            clock.clone(),
        );
        let validator = Validator::new(
            config.event_type_priorities.clone(),
            config.clock_skew_tolerance,
            clock.clone(),
        );

        EventPipeline {
            config,
            validator,
            queues,
            dedup,
            executor,
            scheduler,
            retries,
            monitor,
            signals,
            clock,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(None),
        }
    }
}

/// The event-processing pipeline: admission, priority queues, batch execution, retries and
/// monitoring behind one handle.
pub struct EventPipeline {
    config: PipelineConfig,
    validator: Validator,
    queues: Arc<PriorityQueueManager>,
    dedup: Arc<DeduplicationCache>,
    executor: Arc<PipelineExecutor>,
    scheduler: BatchScheduler,
    retries: Arc<RetryManager>,
    monitor: Arc<PerformanceMonitor>,
    signals: SignalBus,
    clock: Arc<dyn Clock>,
    stopped: AtomicBool,
    tasks: Mutex<Option<RunningTasks>>,
}

impl EventPipeline {
    pub fn build(config: PipelineConfig, collaborators: Collaborators) -> EventPipelineBuilder {
        EventPipelineBuilder {
            config,
            collaborators,
            clock: Arc::new(SystemClock),
            handlers: HandlerRegistry::with_defaults(),
            shared_deduplication: false,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate and admit an event.
    ///
    /// Critical events, and events of at least `idle_bypass_min_priority` while fewer than
    /// `immediate_threshold` events are queued, run immediately and their result is returned.
    /// A failed immediate run is handed to the retry manager and reported as
    /// `PipelineError::Stage`. Everything else is queued, or dropped if the queues are full.
    pub async fn submit(&self, payload: Value) -> Result<Admission, PipelineError> {
        let event = self.validator.validate(&payload)?;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PipelineError::Stopped);
        }

        let priority = event.priority;
        let queued = QueuedEvent::new(event, self.clock.now());

        if self.bypasses_queue(priority) {
            let result = self.executor.execute(&queued).await;
            return match result.error() {
                Some(error) => {
                    let error = error.clone();
                    let processing_id = result.processing_id.clone();
                    drop(self.retries.on_failure(queued, &error));
                    Err(PipelineError::Stage {
                        processing_id,
                        error,
                    })
                }
                None => Ok(Admission::Processed(result)),
            };
        }

        let processing_id = queued.event.processing_id.clone();
        match self.queues.enqueue(queued) {
            Ok(()) => Ok(Admission::Queued {
                processing_id,
                priority,
            }),
            Err(error) => {
                warn!(
                    processing_id = %processing_id,
                    priority = priority.as_str(),
                    "dropping event: {}",
                    error
                );
                self.monitor.record_dropped(priority, error.reason());
                Err(error.into())
            }
        }
    }

    fn bypasses_queue(&self, priority: Priority) -> bool {
        priority == Priority::Critical
            || (priority.at_least(self.config.idle_bypass_min_priority)
                && self.queues.len() < self.config.immediate_threshold)
    }

    /// Drain and execute one batch.
    pub async fn run_batch_cycle(&self) -> BatchReport {
        self.scheduler.run_cycle().await
    }

    /// Expire deduplication keys, move due retries back to the queues and purge old dead
    /// letters.
    pub fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport {
            expired_keys: self.dedup.sweep(),
            ..Default::default()
        };

        for event in self.retries.take_due() {
            let priority = event.priority();
            let processing_id = event.event.processing_id.clone();
            match self.queues.enqueue(event) {
                Ok(()) => report.requeued += 1,
                Err(error) => {
                    warn!(
                        processing_id = %processing_id,
                        priority = priority.as_str(),
                        "dropping retry: {}",
                        error
                    );
                    self.monitor.record_dropped(priority, error.reason());
                    report.dropped += 1;
                }
            }
        }

        report.purged_dead_letters = self.retries.purge_dead_letters();
        report
    }

    /// Close the monitoring window and publish a `MetricsUpdate`.
    pub fn sample_metrics(&self) -> MetricsSnapshot {
        self.monitor.sample(&self.backlog())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.monitor.snapshot(&self.backlog())
    }

    pub fn health(&self) -> HealthState {
        self.monitor.health(&self.backlog())
    }

    pub fn dead_letters(&self) -> Vec<FailedEvent> {
        self.retries.dead_letters()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineSignal> {
        self.signals.subscribe()
    }

    pub fn queued(&self) -> usize {
        self.queues.len()
    }

    fn backlog(&self) -> Backlog {
        Backlog {
            queue_depths: self.queues.depths(),
            retry_pending: self.retries.pending_len(),
            dead_letters: self.retries.dead_letter_len(),
        }
    }

    /// Spawn the batch, cleanup and metrics loops. Each first ticks one period after start.
    /// Does nothing if the loops are already running.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_some() {
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        self.stopped.store(false, Ordering::SeqCst);
        self.monitor.set_running(true);

        let pipeline = self.clone();
        let batch = spawn_loop(self.config.batch_interval, rx.clone(), move || {
            let pipeline = pipeline.clone();
            async move {
                drop(pipeline.run_batch_cycle().await);
            }
        });

        let pipeline = self.clone();
        let cleanup = spawn_loop(self.config.cleanup_interval, rx.clone(), move || {
            let pipeline = pipeline.clone();
            async move {
                _ = pipeline.run_cleanup();
            }
        });

        let pipeline = self.clone();
        let metrics = spawn_loop(self.config.metrics_interval, rx, move || {
            let pipeline = pipeline.clone();
            async move {
                drop(pipeline.sample_metrics());
            }
        });

        info!(
            batch_interval_ms = self.config.batch_interval.as_millis() as u64,
            cleanup_interval_ms = self.config.cleanup_interval.as_millis() as u64,
            metrics_interval_ms = self.config.metrics_interval.as_millis() as u64,
            "event pipeline started"
        );

        *tasks = Some(RunningTasks {
            shutdown,
            handles: vec![batch, cleanup, metrics],
        });
    }

    /// Stop the periodic loops and wait for them to finish their current tick. Events still
    /// queued stay queued; later `submit` calls fail with `PipelineError::Stopped`.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.monitor.set_running(false);

        let running = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        _ = running.shutdown.send(true);
        for handle in running.handles {
            if let Err(error) = handle.await {
                warn!("pipeline task ended abnormally: {}", error);
            }
        }
        info!(queued = self.queues.len(), "event pipeline stopped");
    }
}

fn spawn_loop<F, Fut>(
    period: time::Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(time::Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn pipeline(config: PipelineConfig) -> (EventPipeline, ManualClock) {
        let clock = ManualClock::default();
        let pipeline = EventPipeline::build(config, Collaborators::in_memory())
            .clock(Arc::new(clock.clone()))
            .build();
        (pipeline, clock)
    }

    fn event(clock: &ManualClock, event_type: &str, n: u64) -> Value {
        json!({
            "type": event_type,
            "sessionId": "s1",
            "timestamp": clock.now().timestamp_millis(),
            "data": {"n": n},
        })
    }

    #[tokio::test]
    async fn idle_bypass_needs_minimum_priority() {
        let (pipeline, clock) = pipeline(PipelineConfig::default());

        let search = pipeline.submit(event(&clock, "search", 1)).await.unwrap();
        assert!(matches!(search, Admission::Processed(_)));

        let click = pipeline.submit(event(&clock, "click", 1)).await.unwrap();
        assert!(matches!(
            click,
            Admission::Queued {
                priority: Priority::Low,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn busy_queues_stop_the_bypass_but_not_for_critical() {
        let (pipeline, clock) = pipeline(PipelineConfig {
            immediate_threshold: 2,
            ..Default::default()
        });

        for n in 0..2 {
            drop(pipeline.submit(event(&clock, "page_view", n)).await.unwrap());
        }
        assert_eq!(pipeline.queued(), 2);

        let search = pipeline.submit(event(&clock, "search", 1)).await.unwrap();
        assert!(matches!(search, Admission::Queued { .. }));

        let booking = pipeline
            .submit(event(&clock, "booking_complete", 1))
            .await
            .unwrap();
        assert!(matches!(booking, Admission::Processed(_)));
    }

    #[tokio::test]
    async fn validation_errors_are_returned() {
        let (pipeline, _) = pipeline(PipelineConfig::default());
        let result = pipeline.submit(json!({"type": "page_view"})).await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
        assert_eq!(pipeline.snapshot().dropped, 0);
    }

    #[tokio::test]
    async fn start_and_stop() {
        let (pipeline, clock) = pipeline(PipelineConfig {
            batch_interval: time::Duration::from_millis(10),
            ..Default::default()
        });
        let pipeline = Arc::new(pipeline);
        assert_eq!(pipeline.health(), HealthState::Unhealthy);

        pipeline.start();
        pipeline.start();
        assert_eq!(pipeline.health(), HealthState::Healthy);

        drop(pipeline.submit(event(&clock, "page_view", 1)).await.unwrap());
        for _ in 0..100 {
            if pipeline.snapshot().processed == 1 {
                break;
            }
            tokio::time::sleep(time::Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.snapshot().processed, 1);

        pipeline.stop().await;
        assert_eq!(pipeline.health(), HealthState::Unhealthy);
        assert!(matches!(
            pipeline.submit(event(&clock, "page_view", 2)).await,
            Err(PipelineError::Stopped)
        ));
        assert!(matches!(
            pipeline.submit(json!("nope")).await,
            Err(PipelineError::Validation(_))
        ));
    }
}
