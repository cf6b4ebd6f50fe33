use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::event::{PipelineResult, QueuedEvent};
use crate::monitor::PerformanceMonitor;
use crate::pipeline::PipelineExecutor;
use crate::priority_queue::PriorityQueueManager;
use crate::retry::RetryManager;

/// What one batch cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub drained: usize,
    pub chunks: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Drains a priority-ordered batch from the queues and runs it through the executor, one
/// chunk of `concurrency` events at a time. Each event of a chunk runs on its own task. A
/// chunk finishes entirely before the next one starts; within a chunk events complete in any
/// order.
pub struct BatchScheduler {
    batch_size: usize,
    concurrency: usize,
    queues: Arc<PriorityQueueManager>,
    executor: Arc<PipelineExecutor>,
    retries: Arc<RetryManager>,
    monitor: Arc<PerformanceMonitor>,
    clock: Arc<dyn Clock>,
}

impl BatchScheduler {
    pub fn new(
        batch_size: usize,
        concurrency: usize,
        queues: Arc<PriorityQueueManager>,
        executor: Arc<PipelineExecutor>,
        retries: Arc<RetryManager>,
        monitor: Arc<PerformanceMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            batch_size,
            concurrency: concurrency.max(1),
            queues,
            executor,
            retries,
            monitor,
            clock,
        }
    }

    pub async fn run_cycle(&self) -> BatchReport {
        let batch = self.queues.drain(self.batch_size);
        if batch.is_empty() {
            return BatchReport::default();
        }

        let start = Instant::now();
        let now = self.clock.now();
        for event in &batch {
            self.monitor.record_queue_wait(event.queue_wait(now));
        }

        let mut report = BatchReport {
            drained: batch.len(),
            ..Default::default()
        };

        for chunk in batch.chunks(self.concurrency) {
            report.chunks += 1;
            let results = self.run_chunk(chunk).await;

            for (event, result) in chunk.iter().zip(results) {
                let Some(result) = result else {
                    report.failed += 1;
                    continue;
                };
                if result.is_duplicate() {
                    report.duplicates += 1;
                } else if let Some(error) = result.error() {
                    report.failed += 1;
                    drop(self.retries.on_failure(event.clone(), error));
                } else {
                    report.processed += 1;
                }
            }
        }

        report.elapsed = start.elapsed();
        self.monitor.record_batch(report.drained, report.elapsed);
        debug!(
            drained = report.drained,
            chunks = report.chunks,
            processed = report.processed,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch cycle complete"
        );

        report
    }

    /// Run every event of `chunk` on its own task and wait for all of them. Results come back
    /// in chunk order; `None` marks a task that panicked.
    async fn run_chunk(&self, chunk: &[QueuedEvent]) -> Vec<Option<PipelineResult>> {
        let mut tasks = JoinSet::new();
        for (index, event) in chunk.iter().cloned().enumerate() {
            let executor = self.executor.clone();
            drop(tasks.spawn(async move { (index, executor.execute(&event).await) }));
        }

        let mut results: Vec<Option<PipelineResult>> = vec![None; chunk.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!("pipeline task failed: {}", e),
            }
        }

        results
    }
}
