use thiserror::Error;

#[derive(Error, Debug)]
pub enum KosError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The embedding/compute service failed, timed out or returned garbage.
    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// No concurrency slot became free before the wait timeout.
    #[error("Service overloaded: {0}")]
    Overloaded(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KosError {
    /// Overload is a retry-later condition, not a hard failure.
    pub fn is_overloaded(&self) -> bool {
        matches!(self, KosError::Overloaded(_))
    }
}

impl From<config::ConfigError> for KosError {
    fn from(err: config::ConfigError) -> Self {
        KosError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KosError>;
