//! Error taxonomy shared by every module of the bridge

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed JSON, quoting or base64
    #[error("format error: {0}")]
    Format(String),

    /// Well-formed input that is semantically incomplete
    #[error("validation error: {0}")]
    Validation(String),

    /// Mutation would break a metric invariant
    #[error("invariant error: {0}")]
    Invariant(String),

    /// Binary payload has the wrong length for the requested value
    #[error("invalid payload")]
    InvalidPayload,

    /// Operation attempted in the wrong lifecycle state
    #[error("state error: {0}")]
    State(String),

    /// Invalid client configuration
    #[error("config error: {0}")]
    Config(String),

    /// Unknown decoder variant
    #[error("selection error: {0}")]
    Selection(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("sink error: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, Error>;
