use thiserror::Error;

/// Errors produced by the bastion protocol and gateway layers.
#[derive(Debug, Error)]
pub enum BastionError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed message: {0}")]
    InvalidMessage(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    #[error("inventory error: {0}")]
    Inventory(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for BastionError {
    fn from(e: serde_json::Error) -> Self {
        BastionError::Codec(e.to_string())
    }
}

pub type BastionResult<T> = Result<T, BastionError>;
