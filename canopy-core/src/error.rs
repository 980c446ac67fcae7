use canopy_scanner::ScanError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read input {path}: {reason}")]
    Input { path: PathBuf, reason: String },

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Worker task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, HarvestError>;
