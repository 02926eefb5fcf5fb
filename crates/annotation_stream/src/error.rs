//! Error types for the annotation stream.

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation stream error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server address did not resolve to any socket address
    #[error("address '{0}' did not resolve")]
    AddressResolution(String),

    /// Connecting to the server failed (refused, unreachable, timed out)
    #[error("connection failed: {0}")]
    Connection(#[source] std::io::Error),

    /// Read or write failure on an established connection
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Fewer bytes were available than a fixed-size field expects
    #[error("truncated read: expected {expected} bytes, {available} available")]
    TruncatedRead { expected: usize, available: usize },

    /// Malformed field content, e.g. a label that is not valid UTF-8
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Photo or pose could not be obtained from the frame source
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::InvalidEncoding(format!("label is not valid UTF-8: {}", err))
    }
}
