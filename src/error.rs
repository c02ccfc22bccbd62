use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AtlasregError {
    #[error("dataset is not available: {0}")]
    NotAvailable(String),

    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("invalid dataset specifier: {0}")]
    InvalidSpecifier(String),

    #[error("dataset {dataset} requires atlas {atlas}, which is not available locally")]
    #[diagnostic(help("download the atlas first, then retry"))]
    MissingAtlas { dataset: String, atlas: String },

    #[error("a download for {0} is already in progress")]
    DownloadInProgress(String),

    #[error("{provider} request failed: {message}")]
    NetworkFailure { provider: String, message: String },

    #[error("{provider} returned status {status}: {message}")]
    HttpStatus {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("dataset {dataset} is missing required field {field}")]
    MissingField { dataset: String, field: String },

    #[error("download of {dataset} is unusable: {reason}")]
    InvalidDownload { dataset: String, reason: String },

    #[error("dataset is not downloaded: {0}")]
    NotDownloaded(String),

    #[error("no usable records in {0}")]
    EmptyDataset(String),

    #[error("malformed NRRD: {0}")]
    Nrrd(String),

    #[error("no loader could read {path}: {}", render_attempts(.attempts))]
    UnsupportedFormat {
        path: String,
        attempts: Vec<StrategyFailure>,
    },

    #[error("all {total} elements fall outside the atlas volume {shape:?}")]
    OutOfBounds { total: usize, shape: [usize; 3] },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid atlas frame: {0}")]
    InvalidAtlasFrame(String),

    #[error("atlas metadata error: {0}")]
    AtlasMetadata(String),

    #[error("volume resampling failed: {}", render_attempts(.attempts))]
    ResampleFailed { attempts: Vec<StrategyFailure> },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("background task failed: {0}")]
    Worker(String),
}

/// One failed attempt inside a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyFailure {
    pub strategy: String,
    pub reason: String,
}

impl StrategyFailure {
    pub fn new(strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

fn render_attempts(attempts: &[StrategyFailure]) -> String {
    if attempts.is_empty() {
        return "no strategy was attempted".to_string();
    }
    attempts
        .iter()
        .map(|attempt| attempt.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_lists_attempts() {
        let err = AtlasregError::UnsupportedFormat {
            path: "scan.bin".to_string(),
            attempts: vec![
                StrategyFailure::new("nrrd", "missing NRRD magic"),
                StrategyFailure::new("raw", "no expected shape"),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("scan.bin"));
        assert!(message.contains("nrrd: missing NRRD magic"));
        assert!(message.contains("raw: no expected shape"));
    }
}
