use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Index {0} is not registered")]
    IndexNotFound(String),

    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid label selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Unknown controller state: {0}")]
    UnknownState(String),

    #[error("Controller {0} has already been started")]
    AlreadyRunning(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Outcome of a failed reconciliation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Sync failed: {0}")]
    Failed(String),

    #[error("Sync handler panicked: {0}")]
    Panicked(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl SyncError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        SyncError::Failed(message.to_string())
    }
}

impl From<ControllerError> for SyncError {
    fn from(err: ControllerError) -> Self {
        SyncError::Store(err.to_string())
    }
}
