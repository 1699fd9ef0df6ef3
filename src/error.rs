use crate::event::SessionErrorData;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session error ({}): {}", .0.error_type, .0.message)]
    Session(SessionErrorData),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by event handlers. Never propagated past the bus.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
