use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    /// Bad or missing watch list / settings. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network failure, timeout or rate limit on an external source.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Malformed event data that cannot be turned into a transfer.
    #[error("classification failed: {0}")]
    Classification(String),

    /// The notification channel rejected or never received a message.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl WatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WatchError::SourceUnavailable(_))
    }
}

pub type Result<T, E = WatchError> = std::result::Result<T, E>;
