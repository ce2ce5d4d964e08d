use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Watch stream closed: {0}")]
    WatchClosed(String),

    #[error("Resource version {0} is too old")]
    Expired(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the failure means the watch must be restarted from a fresh list
    pub fn requires_relist(&self) -> bool {
        matches!(self, BridgeError::Expired(_) | BridgeError::WatchClosed(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
