//! Codec error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire frames
#[derive(Error, Debug)]
pub enum CodecError {
    /// Frame was not valid JSON, or a payload did not match its expected shape
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame was valid JSON but not a recognizable protocol frame
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// A response carried an empty result array where a payload was expected
    #[error("Empty result for method {method}")]
    EmptyResult { method: String },
}
