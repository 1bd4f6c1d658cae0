use job_sync::SyncError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Sync(#[from] SyncError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("no API key; set SYNTH_API_KEY or pass --api-key")]
    MissingApiKey,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
