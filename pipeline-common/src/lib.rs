pub mod clock;
pub mod collaborators;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod event;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod priority_queue;
pub mod retry;
pub mod scheduler;
pub mod signals;
pub mod validation;

pub use engine::{Admission, EventPipeline};
pub use error::PipelineError;
