use std::fmt;

use thiserror::Error;

/// Why the current watermark content cannot be applied yet.
///
/// This is state the caller renders next to the input, not a failure of
/// any operation; `UnitBuilder::validation` reports it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("no watermark content selected")]
    NoContent,

    #[error("line {} is empty", .line + 1)]
    EmptyLine { line: usize },

    #[error("line {} has {length} characters (limit {limit})", .line + 1)]
    TooLong { line: usize, limit: usize, length: usize },

    #[error("custom text has not been confirmed")]
    UnconfirmedCustomText,
}

#[derive(Error, Debug)]
pub enum TilemarkError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("watermark content is not valid: {0}")]
    Validation(#[from] ValidationIssue),

    #[error("failed to parse PDF: {0}")]
    Decode(String),

    #[error("failed to render page {index}: {message}")]
    PageRender { index: usize, message: String },

    #[error("pdf error: {0}")]
    Pdf(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("export not available: {0}")]
    ExportBlocked(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TilemarkError {
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            TilemarkError::Decode(_) | TilemarkError::PageRender { .. }
        )
    }
}

pub(crate) fn lopdf_err<E: fmt::Display>(err: E) -> TilemarkError {
    TilemarkError::Pdf(err.to_string())
}

pub(crate) fn image_err<E: fmt::Display>(err: E) -> TilemarkError {
    TilemarkError::Image(err.to_string())
}
