use thiserror::Error;

#[derive(Error, Debug)]
pub enum StashError {
    #[error("unknown record type: {0}")]
    UnknownType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StashError {
    /// Errors caused by the content of a single op rather than by local
    /// storage. Sweeps skip these instead of stopping.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::UnknownType(_) | Self::InvalidPayload(_))
    }
}

impl From<reqwest::Error> for StashError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else {
            Self::Http(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StashError>;
