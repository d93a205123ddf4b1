use std::fmt;

/// Result type for tracepipe-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the store layer
#[derive(Debug)]
pub enum Error {
    /// Database operation failed
    Database(rusqlite::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// Batch blob could not be encoded or decoded
    Codec(String),

    /// Stored data contradicts an invariant (unknown codec byte,
    /// event-count mismatch, missing batch)
    Corrupt(String),

    /// Caller handed the store a batch it refuses to persist
    InvalidBatch(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Database(err) => write!(f, "Database error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Codec(msg) => write!(f, "Codec error: {}", msg),
            Error::Corrupt(msg) => write!(f, "Corrupt store: {}", msg),
            Error::InvalidBatch(msg) => write!(f, "Invalid batch: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Codec(_) | Error::Corrupt(_) | Error::InvalidBatch(_) => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
