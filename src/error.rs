//! Error handling for the todo-sync client

use std::fmt;
use thiserror::Error;
use todo_sync_auth::AuthError;
use todo_sync_realtime::RealtimeError;

/// Unified error type for the todo-sync client
#[derive(Error, Debug)]
pub enum Error {
    /// REST and session errors, including an expired session
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Push channel errors
    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation needs a signed-in user
    #[error("No active session")]
    MissingSession,
}

impl Error {
    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// HTTP status of a rejected REST call, if that is what failed
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Auth(e) => e.status(),
            _ => None,
        }
    }

    /// True when the user has to sign in again
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Error::Auth(e) => e.is_auth_failure(),
            Error::MissingSession => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
