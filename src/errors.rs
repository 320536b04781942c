use thiserror::Error;

/// Unified error type for peak classification and integration.
///
/// Configuration problems abort a run before any peak is touched.
/// Degenerate conditions on individual peaks are never raised through
/// this type; they zero the peak's output and log a warning instead.
#[derive(Debug, Error)]
pub enum PeakqError {
    /// Invalid user-supplied configuration, reported before processing starts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The run was aborted through the cooperative cancellation flag.
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PeakqError {
    /// Shorthand for an `InvalidArgument` with a formatted message.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        PeakqError::InvalidArgument(msg.into())
    }
}
