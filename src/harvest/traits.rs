//! Ports between the harvest core and the outside world.
//!
//! The browser handle lives in [`crate::traits`]; this module covers the
//! remaining collaborators:
//! - Record persistence via [`RecordSink`]
//! - Asset download and storage via [`AssetSource`] and [`AssetStore`]
//! - One-way progress reporting via [`ProgressSink`]

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::model::FeedRecord;

// ============================================================================
// Record Sink
// ============================================================================

/// Column header written once when a sink is created.
pub const RECORD_COLUMNS: [&str; 5] = ["Date", "Time", "Event_Type", "Content", "Image_Count"];

/// Append-only tabular store for harvested records.
///
/// # Thread Safety
///
/// Sinks are only touched from the single extraction-consuming flow, so they
/// need `Send` but not `Sync`.
pub trait RecordSink: Send {
    /// Creates (or truncates) the store and writes the header row.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the store cannot be created. The pipeline
    /// treats this as a fatal setup fault.
    fn create_with_header(&mut self) -> Result<(), SinkError>;

    /// Appends rows in order. Either all rows are appended or an error is
    /// returned and the caller keeps them for a later retry.
    fn append(&mut self, rows: &[FeedRecord]) -> Result<(), SinkError>;
}

// ============================================================================
// Asset Source / Store
// ============================================================================

/// Fetches the bytes behind an asset URL.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// # Errors
    ///
    /// Returns [`FetchError`] on timeout, transport failure or a non-2xx
    /// status. Implementations must bound each request with a timeout.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Flat destination store addressed by file name.
///
/// Each [`AssetTask`](crate::model::AssetTask) owns a distinct name, so
/// concurrent writers never collide and no locking is required across
/// workers.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, FetchError>;

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<(), FetchError>;
}

// ============================================================================
// Progress
// ============================================================================

/// Snapshot of pipeline counters published at batch boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub records: usize,
    pub assets_queued: usize,
    pub assets_downloaded: usize,
    /// Fraction of the current stage completed, when it is measurable.
    pub fraction: Option<f32>,
}

/// One-way status channel towards a presentation layer.
pub trait ProgressSink: Send + Sync {
    fn status(&self, message: &str);

    fn progress(&self, update: ProgressUpdate);
}

/// Reports progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn status(&self, message: &str) {
        info!("{}", message);
    }

    fn progress(&self, update: ProgressUpdate) {
        info!(
            records = update.records,
            assets_queued = update.assets_queued,
            assets_downloaded = update.assets_downloaded,
            fraction = update.fraction.unwrap_or(0.0),
            "Progress"
        );
    }
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn status(&self, _message: &str) {}

    fn progress(&self, _update: ProgressUpdate) {}
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by a [`RecordSink`].
#[derive(Error, Debug)]
pub enum SinkError {
    /// Underlying file could not be created or written
    #[error("Record sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Row encoding failed
    #[error("Failed to encode rows: {0}")]
    Encode(#[from] csv::Error),

    /// Sink used before `create_with_header`
    #[error("Record sink not initialized")]
    NotInitialized,
}

/// Errors raised while fetching or storing a single asset.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Request exceeded its timeout
    #[error("Timed out fetching {0}")]
    Timeout(String),

    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// Connection or protocol failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Destination store failure
    #[error("Store error: {0}")]
    Store(#[from] std::io::Error),

    /// Worker task panicked or was aborted
    #[error("Worker failed: {0}")]
    Worker(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            FetchError::Timeout(url)
        } else if let Some(status) = e.status() {
            FetchError::Status {
                url,
                status: status.as_u16(),
            }
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_columns_match_sink_layout() {
        assert_eq!(RECORD_COLUMNS.len(), 5);
        assert_eq!(RECORD_COLUMNS[4], "Image_Count");
    }

    #[test]
    fn test_progress_update_serialization() {
        let update = ProgressUpdate {
            records: 3,
            assets_queued: 7,
            assets_downloaded: 2,
            fraction: Some(0.5),
        };
        let json = serde_json::to_value(update).unwrap();
        assert_eq!(json["records"], 3);
        assert_eq!(json["assets_queued"], 7);
        assert_eq!(json["fraction"], 0.5);
    }

    #[test]
    fn test_fetch_error_messages() {
        let err = FetchError::Status {
            url: "https://h/x.jpg".to_string(),
            status: 404,
        };
        assert_eq!(err.to_string(), "HTTP 404 for https://h/x.jpg");
    }
}
