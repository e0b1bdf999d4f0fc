//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The registry is unreachable, timed out, or returned corrupt data.
    #[error("registry error: {0}")]
    Registry(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    /// A backend-native control operation failed.
    #[error("backend error: {0}")]
    Delegate(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl AppError {
    /// Fatal errors abort the whole service rather than a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Registry(_) | AppError::Invariant(_))
    }
}
