use std::sync::Arc;

use pipeline_common::{Admission, EventPipeline, PipelineError};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::error::WorkerError;

/// Tally of what happened to every line read by an `EventIngester`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub lines: usize,
    pub malformed: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub queued: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Feeds newline-delimited JSON events into an `EventPipeline`.
pub struct EventIngester {
    pipeline: Arc<EventPipeline>,
}

impl EventIngester {
    pub fn new(pipeline: Arc<EventPipeline>) -> Self {
        Self { pipeline }
    }

    /// Submit every line of `input` until it ends or the pipeline stops. Lines that are not
    /// JSON, or that the pipeline refuses, are counted and skipped.
    pub async fn run<R>(&self, input: R) -> Result<IngestReport, WorkerError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut report = IngestReport::default();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            report.lines += 1;

            let payload: Value = match serde_json::from_str(line) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(line = report.lines, "skipping malformed input line: {}", error);
                    metrics::counter!("worker_lines_total", "outcome" => "malformed").increment(1);
                    report.malformed += 1;
                    continue;
                }
            };

            let outcome = match self.pipeline.submit(payload).await {
                Ok(Admission::Processed(result)) if result.is_duplicate() => {
                    report.duplicates += 1;
                    "duplicate"
                }
                Ok(Admission::Processed(_)) => {
                    report.processed += 1;
                    "processed"
                }
                Ok(Admission::Queued { .. }) => {
                    report.queued += 1;
                    "queued"
                }
                Err(PipelineError::Validation(error)) => {
                    warn!(line = report.lines, "event rejected: {}", error);
                    report.rejected += 1;
                    "rejected"
                }
                Err(PipelineError::QueueFull(_)) => {
                    report.dropped += 1;
                    "dropped"
                }
                Err(PipelineError::Stage { processing_id, .. }) => {
                    debug!(processing_id = %processing_id, "immediate run failed, retry scheduled");
                    report.failed += 1;
                    "failed"
                }
                Err(PipelineError::Stopped) => {
                    info!("pipeline stopped, no longer reading input");
                    break;
                }
            };
            metrics::counter!("worker_lines_total", "outcome" => outcome).increment(1);
        }

        Ok(report)
    }
}
