//! The fixed sequence of stages every admitted event goes through.
//!
//! Only core-processing and storage can fail a run. Enrichment, cache-update,
//! automation-trigger and notification log their own failures and carry on.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::collaborators::Collaborators;
use crate::dedup::{DeduplicationCache, DeduplicationKey};
use crate::error::StageError;
use crate::event::{
    PipelineOutcome, PipelineResult, ProcessedEvent, QueuedEvent, Stage, ValidatedEvent,
};
use crate::handlers::HandlerRegistry;
use crate::monitor::PerformanceMonitor;
use crate::signals::{PipelineSignal, SignalBus};

/// Session activity is kept in the cache for this long after the last event.
const SESSION_ACTIVITY_TTL: Duration = Duration::from_secs(30 * 60);

fn session_activity_key(session_id: &str) -> String {
    format!("session:{session_id}:activity")
}

struct StageTimer {
    started: Instant,
    timings: BTreeMap<Stage, Duration>,
}

impl StageTimer {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            timings: BTreeMap::new(),
        }
    }

    fn record(&mut self, stage: Stage, since: Instant) {
        _ = self.timings.insert(stage, since.elapsed());
    }
}

pub struct PipelineExecutor {
    handlers: HandlerRegistry,
    dedup: Arc<DeduplicationCache>,
    enable_deduplication: bool,
    collaborators: Collaborators,
    monitor: Arc<PerformanceMonitor>,
    signals: SignalBus,
    clock: Arc<dyn Clock>,
}

impl PipelineExecutor {
    pub fn new(
        handlers: HandlerRegistry,
        dedup: Arc<DeduplicationCache>,
        enable_deduplication: bool,
        collaborators: Collaborators,
        monitor: Arc<PerformanceMonitor>,
        signals: SignalBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            handlers,
            dedup,
            enable_deduplication,
            collaborators,
            monitor,
            signals,
            clock,
        }
    }

    /// Run `queued` through every stage and record the outcome with the monitor.
    ///
    /// Retries skip the deduplication check: their first attempt already recorded the key.
    pub async fn execute(&self, queued: &QueuedEvent) -> PipelineResult {
        let event = &queued.event;
        let mut timer = StageTimer::start();

        let since = Instant::now();
        let context = self.enrich(event).await;
        timer.record(Stage::Enrichment, since);

        if self.enable_deduplication && queued.retry_count == 0 {
            let since = Instant::now();
            let duplicate = self.dedup.seen(DeduplicationKey::for_event(event)).await;
            timer.record(Stage::DeduplicationCheck, since);
            if duplicate {
                debug!(
                    processing_id = %event.processing_id,
                    event_type = %event.event_type,
                    "duplicate event"
                );
                return self.finish(event, PipelineOutcome::Duplicate, timer);
            }
        }

        let since = Instant::now();
        let details = match self.handlers.handle(event) {
            Ok(details) => details,
            Err(error) => return self.fail(queued, error, timer, since),
        };
        timer.record(Stage::CoreProcessing, since);

        let record = ProcessedEvent {
            processing_id: event.processing_id.clone(),
            event_type: event.event_type.clone(),
            priority: event.priority,
            session_id: event.session_id.clone(),
            user_id: event.user_id.clone(),
            timestamp: event.timestamp,
            processed_at: self.clock.now(),
            data: event.data.clone(),
            context,
            details,
        };

        let since = Instant::now();
        if let Err(error) = self.collaborators.store.persist(&record).await {
            return self.fail(queued, StageError::Storage(error), timer, since);
        }
        timer.record(Stage::Storage, since);

        let since = Instant::now();
        self.update_cache(&record).await;
        timer.record(Stage::CacheUpdate, since);

        let since = Instant::now();
        if let Err(error) = self.collaborators.rules.evaluate(&record).await {
            warn!(
                processing_id = %record.processing_id,
                stage = Stage::AutomationTrigger.as_str(),
                "automation rules failed: {}",
                error
            );
        }
        timer.record(Stage::AutomationTrigger, since);

        let since = Instant::now();
        self.signals.publish(PipelineSignal::EventProcessed {
            processing_id: record.processing_id.clone(),
            event_type: record.event_type.clone(),
            priority: record.priority,
            processed_at: record.processed_at,
        });
        timer.record(Stage::Notification, since);

        self.finish(event, PipelineOutcome::Processed, timer)
    }

    /// Look up the session activity left by earlier events and whatever the cache knows about
    /// the user. Misses and cache errors both leave the context empty.
    async fn enrich(&self, event: &ValidatedEvent) -> Map<String, Value> {
        let mut context = Map::new();

        let mut lookups = vec![("session", session_activity_key(&event.session_id))];
        if let Some(user_id) = &event.user_id {
            lookups.push(("user", format!("user:{user_id}")));
        }

        for (name, key) in lookups {
            match self.collaborators.cache.get(&key).await {
                Ok(Some(cached)) => {
                    let value = serde_json::from_str(&cached).unwrap_or(Value::String(cached));
                    drop(context.insert(name.to_owned(), value));
                }
                Ok(None) => {}
                Err(error) => warn!(
                    processing_id = %event.processing_id,
                    stage = Stage::Enrichment.as_str(),
                    key = %key,
                    "enrichment lookup failed: {}",
                    error
                ),
            }
        }

        context
    }

    async fn update_cache(&self, record: &ProcessedEvent) {
        let cache = &self.collaborators.cache;

        if let Err(error) = cache
            .increment(&format!("events:{}:count", record.event_type))
            .await
        {
            warn!(
                processing_id = %record.processing_id,
                stage = Stage::CacheUpdate.as_str(),
                "failed to update event counter: {}",
                error
            );
        }

        let activity = json!({
            "lastEventType": record.event_type,
            "lastEventAt": record.processed_at,
            "userId": record.user_id,
        });
        if let Err(error) = cache
            .set(
                &session_activity_key(&record.session_id),
                activity.to_string(),
                Some(SESSION_ACTIVITY_TTL),
            )
            .await
        {
            warn!(
                processing_id = %record.processing_id,
                stage = Stage::CacheUpdate.as_str(),
                "failed to update session activity: {}",
                error
            );
        }
    }

    fn fail(
        &self,
        queued: &QueuedEvent,
        error: StageError,
        mut timer: StageTimer,
        since: Instant,
    ) -> PipelineResult {
        timer.record(error.stage(), since);
        warn!(
            processing_id = %queued.event.processing_id,
            event_type = %queued.event.event_type,
            stage = error.stage().as_str(),
            retry_count = queued.retry_count,
            "pipeline run failed: {}",
            error
        );
        self.finish(&queued.event, PipelineOutcome::Failed(error), timer)
    }

    fn finish(
        &self,
        event: &ValidatedEvent,
        outcome: PipelineOutcome,
        timer: StageTimer,
    ) -> PipelineResult {
        let result = PipelineResult {
            processing_id: event.processing_id.clone(),
            event_type: event.event_type.clone(),
            outcome,
            total: timer.started.elapsed(),
            stage_timings: timer.timings,
        };
        self.monitor.record_result(&result);
        result
    }
}
