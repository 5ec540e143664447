use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Subscription failure for track {track}: {reason}")]
    SubscriptionFailure { track: String, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Stale event: {0}")]
    StaleEvent(String),

    #[error("Session disconnected before the command was confirmed")]
    Disconnected,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Coarse failure category, for consumers that only need to tell
/// connection problems from per-track problems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connection,
    Subscription,
    InvalidState,
    Stale,
    Native,
}

impl Error {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectionFailure(_) | Self::Disconnected => ErrorClass::Connection,
            Self::SubscriptionFailure { .. } => ErrorClass::Subscription,
            Self::InvalidState(_) => ErrorClass::InvalidState,
            Self::StaleEvent(_) => ErrorClass::Stale,
            Self::Engine(_) => ErrorClass::Native,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
