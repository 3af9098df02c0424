//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Declared or encoded frame length exceeds the configured maximum
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Length that was declared or produced
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Frame body is not a valid protobuf envelope
    #[error("malformed envelope: {0}")]
    Protobuf(String),

    /// Envelope declares a payload type but the matching field is absent
    #[error("payload missing for declared payload type")]
    MissingPayload,

    /// Envelope was well-formed but its JSON payload was not
    #[error("malformed payload on {namespace}: {reason}")]
    MalformedPayload {
        /// Namespace of the offending message
        namespace: String,
        /// Parser diagnostic
        reason: String,
    },
}

impl WireError {
    /// Whether the stream can no longer be trusted after this error.
    ///
    /// A malformed JSON payload sits inside a correctly delimited frame, so
    /// the decoder is still aligned and the connection stays usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WireError::MalformedPayload { .. })
    }
}
