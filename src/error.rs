//! Error taxonomy for the core. Mirrors the flat exception hierarchy of
//! the reference implementation's `joule/errors.py` and
//! `joule/models/pipes/errors.py`: each variant is a *kind*, not a
//! subsystem-specific wrapper, so callers can match on it across module
//! boundaries.

use thiserror::Error;

/// Error invalid at load/register time; aborts startup of the offending
/// entity only, never the whole system.
#[derive(Error, Debug)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Top-level error type returned by core operations.
#[derive(Error, Debug)]
pub enum JouleError {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Programmer error: over-consume, negative consume, write after close.
    #[error("pipe error: {0}")]
    Pipe(String),

    /// Non-monotonic or otherwise malformed write payload.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Normal termination signal for readers: pipe closed with nothing left.
    #[error("pipe is empty and closed")]
    EmptyPipe,

    /// No producer for a requested stream. Callers may retry later.
    #[error("no producer for stream [{0}]")]
    Subscription(String),

    /// Storage-backend failure (insert, extract, remove).
    #[error("data store error: {0}")]
    Data(String),

    /// Requested data is not sufficiently decimated to satisfy `max_rows`.
    #[error("decimation error: {0}")]
    Decimation(String),

    /// Remote-facing error, mapped to an HTTP status code by the (out of
    /// scope) controller.
    #[error("api error: {0}")]
    Api(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ConfigurationError> for JouleError {
    fn from(e: ConfigurationError) -> Self {
        JouleError::Configuration(e.0)
    }
}

pub type Result<T> = std::result::Result<T, JouleError>;
