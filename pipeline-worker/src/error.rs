use thiserror::Error;

/// Enumeration of errors that stop the ingestion loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to read events from input: {0}")]
    InputError(#[from] std::io::Error),
}
