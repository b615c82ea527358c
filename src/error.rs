use std::time::Duration;

use thiserror::Error;

/// Failure reported by the rendering collaborator for one URL attempt.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("renderer returned an unreadable capture: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        CaptureError::Navigation(err.to_string())
    }
}

/// Remote tracker-signature fetch failure. Never fatal to a run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote returned status {0}")]
    Status(u16),

    #[error("release has no usable trackerdb asset")]
    NoAsset,

    #[error("unreadable trackerdb payload: {0}")]
    Parse(String),

    #[error("fetch timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

/// Ledger or sink write failure. Aborts the batch it happens in.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("illegal status transition for url #{index}: {from} -> {to}")]
    IllegalTransition {
        index: usize,
        from: String,
        to: &'static str,
    },
}

impl PersistenceError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}
