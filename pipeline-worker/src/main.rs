//! Read newline-delimited JSON events from stdin and run them through an `EventPipeline`.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tokio::io::{stdin, BufReader};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use pipeline_common::collaborators::{Collaborators, LogStore};
use pipeline_common::metrics::{serve, setup_metrics_router};
use pipeline_common::EventPipeline;
use pipeline_worker::config::Config;
use pipeline_worker::worker::EventIngester;

async fn shutdown() {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to register SIGTERM handler: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
    };

    info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let collaborators = Collaborators {
        store: Arc::new(LogStore {}),
        ..Collaborators::in_memory()
    };
    let pipeline = Arc::new(
        EventPipeline::build(config.pipeline_config(), collaborators)
            .shared_deduplication(config.shared_deduplication)
            .build(),
    );

    let router =
        setup_metrics_router(pipeline.clone()).context("failed to install metrics recorder")?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    });

    pipeline.start();

    let ingester = EventIngester::new(pipeline.clone());
    tokio::select! {
        result = ingester.run(BufReader::new(stdin())) => {
            let report = result?;
            info!(?report, "end of input");
        }
        _ = shutdown() => {}
    }

    pipeline.stop().await;

    // Whatever is still queued gets one last chance before exiting.
    while pipeline.run_batch_cycle().await.drained > 0 {}

    let snapshot = pipeline.snapshot();
    info!(
        processed = snapshot.processed,
        failed = snapshot.failed,
        dropped = snapshot.dropped,
        duplicates = snapshot.duplicates,
        retry_pending = snapshot.retry_pending,
        dead_lettered = snapshot.dead_lettered,
        "event pipeline finished"
    );

    Ok(())
}
