//! Error types for the exchange library.

/// Errors that can occur in the hopwire crate.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// A byte sequence did not form a valid protocol envelope, or named an
    /// unknown envelope variant.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A compressed payload could not be inflated.
    #[error("decompression error: {0}")]
    Decompression(String),

    /// A pipe operation was invoked in a state that forbids it (push before
    /// an observer is set, interaction after close, send after done).
    #[error("pipe state error: {0}")]
    PipeState(&'static str),

    /// A connection or send failure reported by the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// A peer id that is empty or contains characters other than letters
    /// and digits.
    #[error("invalid peer id: {0:?}")]
    InvalidPeerId(String),

    /// A component that runs at most once was started again.
    #[error("already started")]
    AlreadyStarted,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
