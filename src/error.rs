use thiserror::Error;

/// Errors surfaced by the fingerprinting engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to decode audio: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A stage produced nothing to work with. Non-fatal: the pipeline treats
    /// this as "no fingerprints" rather than an abort.
    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("no matches found")]
    NotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
