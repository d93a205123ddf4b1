use std::fmt;

/// Result type for tracepipe-runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the runtime layer
#[derive(Debug)]
pub enum Error {
    /// Stream layer error
    Streams(tracepipe_streams::Error),

    /// Store layer error
    Store(tracepipe_store::Error),

    /// Builder layer error
    Engine(tracepipe_engine::Error),

    /// IO operation failed
    Io(std::io::Error),

    /// Record encoding failed
    Encode(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Internal inconsistency; the owning task fails fast so restart
    /// recovery can take over
    Invariant(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Streams(err) => write!(f, "Stream error: {}", err),
            Error::Store(err) => write!(f, "Store error: {}", err),
            Error::Engine(err) => write!(f, "Engine error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Encode(err) => write!(f, "Encode error: {}", err),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Invariant(msg) => write!(f, "Invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Streams(err) => Some(err),
            Error::Store(err) => Some(err),
            Error::Engine(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Encode(err) => Some(err),
            Error::Config(_) | Error::Invariant(_) => None,
        }
    }
}

impl From<tracepipe_streams::Error> for Error {
    fn from(err: tracepipe_streams::Error) -> Self {
        Error::Streams(err)
    }
}

impl From<tracepipe_store::Error> for Error {
    fn from(err: tracepipe_store::Error) -> Self {
        Error::Store(err)
    }
}

impl From<tracepipe_engine::Error> for Error {
    fn from(err: tracepipe_engine::Error) -> Self {
        Error::Engine(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encode(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}
