use lopdf::ObjectId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("Invalid compression level: {0} (expected lossless, medium or high)")]
    InvalidTier(String),

    #[error("Failed to parse PDF: {0}")]
    CorruptInput(String),

    #[error("Image {id:?} could not be re-encoded: {reason}")]
    ImageReencode { id: ObjectId, reason: String },

    #[error("External tool '{0}' is not available on the search path")]
    ExternalToolUnavailable(String),

    #[error("External tool '{tool}' failed: {message}")]
    ExternalToolFailed { tool: String, message: String },

    #[error("Failed to save PDF: {0}")]
    Save(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompressError {
    pub(crate) fn image(id: ObjectId, reason: impl Into<String>) -> Self {
        CompressError::ImageReencode {
            id,
            reason: reason.into(),
        }
    }
}
