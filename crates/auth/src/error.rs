use thiserror::Error;

/// エラー型
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Login or registration rejected by the server
    #[error("Invalid credentials ({status}): {message}")]
    InvalidCredentials { status: u16, message: String },

    /// Still unauthorized after the request was retried with a fresh token
    #[error("Unauthorized")]
    Unauthorized,

    /// The refresh call failed and the local session was dropped
    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Missing session")]
    MissingSession,

    /// An account response that should have carried an access token did not
    #[error("Account response carried no access token")]
    MissingToken,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Token storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::InvalidCredentials { status, .. } => Some(*status),
            Self::Unauthorized | Self::SessionExpired(_) => Some(401),
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// True when the failure means the user has to sign in again
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::SessionExpired(_) | Self::MissingSession
        )
    }
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        AuthError::Storage(err.to_string())
    }
}
