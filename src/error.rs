use std::time::Duration;

use thiserror::Error;

use crate::camera::CameraId;

/// Errors raised by the capture core.
///
/// Everything except [`SyncError::Overwrite`] and [`SyncError::Empty`] is fatal for the
/// camera group that raised it.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("shared memory `{name}`: {source}")]
    Shm {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ring buffer `{name}` is full: writing index {index} would overwrite unread data")]
    Overwrite { name: String, index: i64 },

    #[error("ring buffer `{name}` has no new data to read")]
    Empty { name: String },

    #[error("`{operation}` is not permitted on a read-only instance of `{name}`")]
    ReadOnly {
        name: String,
        operation: &'static str,
    },

    #[error("`{name}` was attached, not created, by this process and cannot be unlinked here")]
    NotOwner { name: String },

    #[error("element size mismatch for `{name}`: expected {expected} bytes, got {actual}")]
    Shape {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("wait for {what} interrupted by a kill flag")]
    Cancelled { what: String },

    #[error("multi-frame desync: {0}")]
    Desync(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("camera {camera_id}: {reason}")]
    Capture { camera_id: CameraId, reason: String },

    #[error("failed to decode {format} frame: {reason}")]
    Decode { format: String, reason: String },

    #[error("camera {camera_id} rejected its configuration: {reason}")]
    ConfigRejected { camera_id: CameraId, reason: String },

    #[error("camera {0} shut itself down")]
    CameraClosed(CameraId),

    #[error("worker `{0}` panicked")]
    WorkerPanicked(String),

    #[error("no camera group is active")]
    NoCameraGroup,

    #[error("recording: {0}")]
    Recording(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl SyncError {
    /// The caller may back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Overwrite { .. } | SyncError::Empty { .. })
    }

    /// Raised because a kill flag was observed, not because something broke.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled { .. })
    }

    pub(crate) fn shm(name: &str, source: impl Into<std::io::Error>) -> Self {
        SyncError::Shm {
            name: name.to_string(),
            source: source.into(),
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
