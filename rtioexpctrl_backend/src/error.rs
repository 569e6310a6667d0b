use rtiocompiler_backend::{Mu, TimelineError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunError>;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Timeline(#[from] TimelineError),

    /// The core device reached `timestamp` before the event was submitted.
    #[error(
        "RTIO underflow on {device}/{channel}: event {seq} at {timestamp} mu submitted at counter {counter} mu"
    )]
    Underflow {
        seq: u64,
        device: String,
        channel: String,
        timestamp: Mu,
        counter: Mu,
    },

    #[error("device {0} is not compiled")]
    NotCompiled(String),

    #[error("nothing to stream: no device is compiled")]
    NothingToStream,

    #[error("stream worker failed: {0}")]
    Worker(String),

    #[error("failed to initialise logging: {0}")]
    Logging(String),
}
