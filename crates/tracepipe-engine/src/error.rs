use std::fmt;

/// Result type for tracepipe-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the builder layer
#[derive(Debug)]
pub enum Error {
    /// Store layer error
    Store(tracepipe_store::Error),

    /// Types layer error (schema validation)
    Types(tracepipe_types::Error),

    /// CDC record references a batch that is not readable (yet)
    Referential(String),
}

impl Error {
    /// Short classification tag recorded on DLQ entries
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Store(tracepipe_store::Error::Database(_)) => "transient_io",
            Error::Store(tracepipe_store::Error::Io(_)) => "transient_io",
            Error::Store(_) => "corrupt_store",
            Error::Types(_) => "schema",
            Error::Referential(_) => "referential",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Store(err) => write!(f, "Store error: {}", err),
            Error::Types(err) => write!(f, "Types error: {}", err),
            Error::Referential(msg) => write!(f, "Referential error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(err) => Some(err),
            Error::Types(err) => Some(err),
            Error::Referential(_) => None,
        }
    }
}

impl From<tracepipe_store::Error> for Error {
    fn from(err: tracepipe_store::Error) -> Self {
        Error::Store(err)
    }
}

impl From<tracepipe_types::Error> for Error {
    fn from(err: tracepipe_types::Error) -> Self {
        Error::Types(err)
    }
}
