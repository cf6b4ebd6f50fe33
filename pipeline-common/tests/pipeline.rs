use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use pipeline_common::clock::{Clock, ManualClock};
use pipeline_common::collaborators::{Collaborators, DurableStore, MemoryCache, MemoryStore};
use pipeline_common::config::PipelineConfig;
use pipeline_common::error::{CollaboratorError, QueueError, StageError};
use pipeline_common::event::{Priority, ProcessedEvent};
use pipeline_common::monitor::HealthState;
use pipeline_common::signals::PipelineSignal;
use pipeline_common::{Admission, EventPipeline, PipelineError};

/// Fails every persist call while `failing` is set, counting every attempt.
#[derive(Default)]
struct FlakyStore {
    failing: AtomicBool,
    attempts: AtomicUsize,
    inner: MemoryStore,
}

impl FlakyStore {
    fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn persist(&self, record: &ProcessedEvent) -> Result<(), CollaboratorError> {
        _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("store down".to_owned()));
        }
        self.inner.persist(record).await
    }
}

/// Tracks how many persist calls overlap, and how many had completed when each one started.
#[derive(Default)]
struct InFlightStore {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
    completed_at_start: Mutex<Vec<usize>>,
}

#[async_trait]
impl DurableStore for InFlightStore {
    async fn persist(&self, _record: &ProcessedEvent) -> Result<(), CollaboratorError> {
        self.completed_at_start
            .lock()
            .unwrap()
            .push(self.completed.load(Ordering::SeqCst));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        _ = self.peak.fetch_max(running, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;

        _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        _ = self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    pipeline: Arc<EventPipeline>,
    clock: ManualClock,
    store: Arc<FlakyStore>,
}

fn harness(config: PipelineConfig, store: FlakyStore) -> Harness {
    let clock = ManualClock::default();
    let store = Arc::new(store);
    let collaborators = Collaborators {
        store: store.clone(),
        ..Collaborators::in_memory()
    };
    let pipeline = EventPipeline::build(config, collaborators)
        .clock(Arc::new(clock.clone()))
        .build();
    Harness {
        pipeline: Arc::new(pipeline),
        clock,
        store,
    }
}

/// A configuration whose loops never tick on their own during a test.
fn manual_config() -> PipelineConfig {
    PipelineConfig {
        batch_interval: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(3600),
        metrics_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn event(clock: &ManualClock, event_type: &str, data: Value) -> Value {
    json!({
        "type": event_type,
        "sessionId": "s1",
        "userId": "u1",
        "timestamp": clock.now().to_rfc3339(),
        "data": data,
    })
}

#[tokio::test]
async fn booking_runs_immediately_and_page_view_waits_for_the_batch() {
    let h = harness(manual_config(), FlakyStore::default());

    let booking = h
        .pipeline
        .submit(json!({
            "type": "booking_complete",
            "sessionId": "s1",
            "timestamp": h.clock.now().timestamp_millis()
        }))
        .await
        .unwrap();
    let page_view = h
        .pipeline
        .submit(json!({
            "type": "page_view",
            "sessionId": "s1",
            "timestamp": h.clock.now().timestamp_millis()
        }))
        .await
        .unwrap();

    let booking_id = match &booking {
        Admission::Processed(result) => {
            assert!(result.is_processed());
            result.processing_id.clone()
        }
        other => panic!("booking should bypass the queues: {:?}", other),
    };
    assert!(matches!(
        page_view,
        Admission::Queued {
            priority: Priority::Low,
            ..
        }
    ));
    assert_ne!(booking_id, page_view.processing_id());

    let report = h.pipeline.run_batch_cycle().await;
    assert_eq!(report.drained, 1);
    assert_eq!(report.processed, 1);

    let records = h.store.inner.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].processing_id, booking_id);
    assert_eq!(records[1].processing_id, page_view.processing_id());
    assert_eq!(h.pipeline.snapshot().processed, 2);
}

#[tokio::test]
async fn duplicates_within_the_window_are_processed_once() {
    let h = harness(manual_config(), FlakyStore::default());
    let payload = event(&h.clock, "booking_complete", json!({"bookingId": "b1"}));

    let first = h.pipeline.submit(payload.clone()).await.unwrap();
    h.clock.advance(Duration::from_secs(4));
    let second = h.pipeline.submit(payload.clone()).await.unwrap();

    match (&first, &second) {
        (Admission::Processed(first), Admission::Processed(second)) => {
            assert!(first.is_processed());
            assert!(second.is_duplicate());
        }
        other => panic!("unexpected admissions: {:?}", other),
    }
    assert_eq!(h.store.attempts(), 1);
    assert_eq!(h.pipeline.snapshot().duplicates, 1);

    // Outside the window the same content is a new event.
    h.clock.advance(Duration::from_secs(2));
    let third = h.pipeline.submit(payload).await.unwrap();
    assert!(matches!(third, Admission::Processed(ref result) if result.is_processed()));
    assert_eq!(h.store.attempts(), 2);
}

#[tokio::test]
async fn batches_drain_in_priority_order() {
    let h = harness(
        PipelineConfig {
            immediate_threshold: 0,
            concurrency: 1,
            ..manual_config()
        },
        FlakyStore::default(),
    );

    for (n, event_type) in [
        "page_view",
        "search",
        "booking_start",
        "click",
        "user_login",
    ]
    .into_iter()
    .enumerate()
    {
        let admission = h
            .pipeline
            .submit(event(&h.clock, event_type, json!({"n": n})))
            .await
            .unwrap();
        assert!(matches!(admission, Admission::Queued { .. }));
    }

    let report = h.pipeline.run_batch_cycle().await;
    assert_eq!(report.drained, 5);
    assert_eq!(report.chunks, 5);

    let order: Vec<String> = h
        .store
        .inner
        .records()
        .into_iter()
        .map(|record| record.event_type)
        .collect();
    assert_eq!(
        order,
        vec![
            "booking_start",
            "user_login",
            "search",
            "page_view",
            "click"
        ]
    );
}

#[tokio::test]
async fn chunk_count_follows_batch_size_and_concurrency() {
    let h = harness(
        PipelineConfig {
            immediate_threshold: 0,
            batch_size: 25,
            concurrency: 10,
            ..manual_config()
        },
        FlakyStore::default(),
    );

    for n in 0..30 {
        drop(
            h.pipeline
                .submit(event(&h.clock, "click", json!({"n": n})))
                .await
                .unwrap(),
        );
    }

    let first = h.pipeline.run_batch_cycle().await;
    assert_eq!((first.drained, first.chunks, first.processed), (25, 3, 25));
    let second = h.pipeline.run_batch_cycle().await;
    assert_eq!((second.drained, second.chunks, second.processed), (5, 1, 5));
    assert_eq!(h.pipeline.queued(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunks_run_in_parallel_up_to_the_concurrency_limit() {
    let store = Arc::new(InFlightStore::default());
    let clock = ManualClock::default();
    let pipeline = EventPipeline::build(
        PipelineConfig {
            immediate_threshold: 0,
            batch_size: 25,
            concurrency: 10,
            ..manual_config()
        },
        Collaborators {
            store: store.clone(),
            ..Collaborators::in_memory()
        },
    )
    .clock(Arc::new(clock.clone()))
    .build();

    for n in 0..25 {
        drop(
            pipeline
                .submit(event(&clock, "click", json!({"n": n})))
                .await
                .unwrap(),
        );
    }

    let report = pipeline.run_batch_cycle().await;
    assert_eq!(
        (report.drained, report.chunks, report.processed),
        (25, 3, 25)
    );

    let peak = store.peak.load(Ordering::SeqCst);
    assert!(
        peak > 1,
        "events of a chunk should overlap, peak was {peak}"
    );
    assert!(peak <= 10, "at most 10 events in flight, peak was {peak}");

    // Every persist of chunk N starts after all of chunk N - 1 completed.
    let mut completed_at_start = store.completed_at_start.lock().unwrap().clone();
    completed_at_start.sort_unstable();
    for (position, completed) in completed_at_start.into_iter().enumerate() {
        assert!(
            completed >= (position / 10) * 10,
            "persist #{position} started with only {completed} completed"
        );
    }
}

#[tokio::test]
async fn queue_ceiling_drops_exactly_the_overflow() {
    let h = harness(
        PipelineConfig {
            max_queue_size: 2,
            ..manual_config()
        },
        FlakyStore::default(),
    );

    let mut results = Vec::new();
    for n in 0..3 {
        results.push(
            h.pipeline
                .submit(event(&h.clock, "page_view", json!({"n": n})))
                .await,
        );
    }

    assert!(matches!(results[0], Ok(Admission::Queued { .. })));
    assert!(matches!(results[1], Ok(Admission::Queued { .. })));
    assert!(matches!(
        results[2],
        Err(PipelineError::QueueFull(QueueError::QueueFull {
            capacity: 2
        }))
    ));

    let snapshot = h.pipeline.snapshot();
    assert_eq!(snapshot.dropped, 1);
    assert_eq!(snapshot.queued_total, 2);
    assert_eq!(snapshot.queue_depths.low, 2);
}

#[tokio::test]
async fn failing_event_backs_off_then_dead_letters_once() {
    let h = harness(manual_config(), FlakyStore::failing());
    let mut signals = h.pipeline.subscribe();

    let submitted = h
        .pipeline
        .submit(event(&h.clock, "payment_failed", json!({})))
        .await;
    let processing_id = match submitted {
        Err(PipelineError::Stage {
            processing_id,
            error: StageError::Storage(_),
        }) => processing_id,
        other => panic!("expected a storage failure, got {:?}", other),
    };

    let mut delays = Vec::new();
    for _ in 0..3 {
        assert_eq!(h.pipeline.snapshot().retry_pending, 1);
        assert!(h.pipeline.dead_letters().is_empty());

        // Nothing is due until the full backoff has elapsed.
        let delay = Duration::from_millis(1000 * 2u64.pow(delays.len() as u32));
        h.clock.advance(delay - Duration::from_millis(1));
        assert_eq!(h.pipeline.run_cleanup().requeued, 0);
        h.clock.advance(Duration::from_millis(1));
        assert_eq!(h.pipeline.run_cleanup().requeued, 1);
        delays.push(delay);

        let report = h.pipeline.run_batch_cycle().await;
        assert_eq!(report.failed, 1);
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(4000),
        ]
    );
    assert_eq!(h.store.attempts(), 4);

    let dead_letters = h.pipeline.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].processing_id, processing_id);
    assert_eq!(dead_letters[0].retry_count, 4);

    // Dead letters never come back.
    h.clock.advance(Duration::from_secs(60));
    let cleanup = h.pipeline.run_cleanup();
    assert_eq!(cleanup.requeued, 0);
    assert_eq!(h.pipeline.run_batch_cycle().await.drained, 0);

    let snapshot = h.pipeline.snapshot();
    assert_eq!(snapshot.failed, 4);
    assert_eq!(snapshot.retried, 3);
    assert_eq!(snapshot.dead_lettered, 1);
    assert_eq!(snapshot.retry_pending, 0);
    assert_eq!(snapshot.dead_letter_size, 1);

    let mut dead_lettered = 0;
    while let Ok(signal) = signals.try_recv() {
        if let PipelineSignal::EventDeadLettered {
            processing_id: id, ..
        } = signal
        {
            assert_eq!(id, processing_id);
            dead_lettered += 1;
        }
    }
    assert_eq!(dead_lettered, 1);

    // Purged after the retention window.
    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.pipeline.run_cleanup().purged_dead_letters, 1);
    assert!(h.pipeline.dead_letters().is_empty());
}

#[tokio::test]
async fn retry_succeeds_once_the_store_recovers() {
    let h = harness(manual_config(), FlakyStore::failing());

    assert!(h
        .pipeline
        .submit(event(
            &h.clock,
            "booking_complete",
            json!({"bookingId": "b1"})
        ))
        .await
        .is_err());

    h.store.set_failing(false);
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.pipeline.run_cleanup().requeued, 1);

    // The retry is not mistaken for a duplicate of its own first attempt.
    let report = h.pipeline.run_batch_cycle().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.duplicates, 0);
    assert_eq!(h.store.inner.records().len(), 1);
}

#[tokio::test]
async fn due_retries_are_dropped_when_the_queues_are_full() {
    let h = harness(
        PipelineConfig {
            max_queue_size: 1,
            ..manual_config()
        },
        FlakyStore::failing(),
    );

    assert!(h
        .pipeline
        .submit(event(&h.clock, "system_error", json!({})))
        .await
        .is_err());
    drop(
        h.pipeline
            .submit(event(&h.clock, "page_view", json!({})))
            .await
            .unwrap(),
    );

    h.clock.advance(Duration::from_secs(1));
    let cleanup = h.pipeline.run_cleanup();
    assert_eq!(cleanup.requeued, 0);
    assert_eq!(cleanup.dropped, 1);

    let snapshot = h.pipeline.snapshot();
    assert_eq!(snapshot.dropped, 1);
    assert_eq!(snapshot.retry_pending, 0);
}

#[tokio::test]
async fn health_flips_with_the_error_rate() {
    let h = harness(manual_config(), FlakyStore::default());
    h.pipeline.start();

    for n in 0..8 {
        drop(
            h.pipeline
                .submit(event(&h.clock, "booking_complete", json!({"n": n})))
                .await
                .unwrap(),
        );
    }
    h.store.set_failing(true);
    for n in 8..10 {
        assert!(h
            .pipeline
            .submit(event(&h.clock, "booking_complete", json!({"n": n})))
            .await
            .is_err());
    }
    h.clock.advance(Duration::from_secs(5));
    let snapshot = h.pipeline.sample_metrics();
    assert!(snapshot.error_rate > 0.1);
    assert_eq!(snapshot.health, HealthState::Unhealthy);
    assert_eq!(h.pipeline.health(), HealthState::Unhealthy);

    h.store.set_failing(false);
    for n in 10..20 {
        drop(
            h.pipeline
                .submit(event(&h.clock, "booking_complete", json!({"n": n})))
                .await
                .unwrap(),
        );
    }
    h.clock.advance(Duration::from_secs(5));
    let snapshot = h.pipeline.sample_metrics();
    assert_eq!(snapshot.error_rate, 0.0);
    assert_eq!(snapshot.health, HealthState::Healthy);

    h.pipeline.stop().await;
    assert_eq!(h.pipeline.health(), HealthState::Unhealthy);
}

#[tokio::test]
async fn shared_cache_deduplicates_across_instances() {
    let clock = ManualClock::default();
    let cache = Arc::new(MemoryCache::with_clock(Arc::new(clock.clone())));
    let instance = |store: Arc<MemoryStore>| {
        EventPipeline::build(
            manual_config(),
            Collaborators {
                cache: cache.clone(),
                store,
                ..Collaborators::in_memory()
            },
        )
        .clock(Arc::new(clock.clone()))
        .shared_deduplication(true)
        .build()
    };
    let first_store = Arc::new(MemoryStore::new());
    let second_store = Arc::new(MemoryStore::new());
    let first = instance(first_store.clone());
    let second = instance(second_store.clone());

    let payload = event(&clock, "booking_complete", json!({"bookingId": "b7"}));
    drop(first.submit(payload.clone()).await.unwrap());
    let again = second.submit(payload).await.unwrap();

    assert!(matches!(again, Admission::Processed(ref result) if result.is_duplicate()));
    assert_eq!(first_store.records().len(), 1);
    assert!(second_store.records().is_empty());
}
