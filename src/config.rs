//! Configuration options for the todo-sync client

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use todo_sync_auth::DEFAULT_TOKEN_KEY;

use crate::error::{Error, Result};

/// Where the access token is persisted between runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStorageKind {
    /// Kept for the lifetime of the process only
    Memory,
    /// JSON file on disk
    File(PathBuf),
}

/// Configuration options for the todo-sync client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// REST base URL, e.g. `https://localhost:7069/api`
    pub api_url: String,

    /// Hub endpoint; `http(s)` and `ws(s)` are both accepted
    pub hub_url: String,

    /// The request timeout
    pub request_timeout: Option<Duration>,

    pub token_storage: TokenStorageKind,

    /// Key the access token is stored under
    pub token_key: String,

    /// Whether the push channel reconnects on its own after a drop
    pub auto_reconnect: bool,

    /// Wait before each reconnect attempt
    pub reconnect_delays: Vec<Duration>,
}

impl ClientOptions {
    /// Options for an API at `api_url` with the hub at `<api_url>/todoHub`
    pub fn new(api_url: &str) -> Self {
        let api_url = api_url.trim_end_matches('/').to_string();
        Self {
            hub_url: format!("{}/todoHub", api_url),
            api_url,
            request_timeout: Some(Duration::from_secs(30)),
            token_storage: TokenStorageKind::Memory,
            token_key: DEFAULT_TOKEN_KEY.to_string(),
            auto_reconnect: true,
            reconnect_delays: vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
        }
    }

    /// Read options from the environment (and a `.env` file if present).
    ///
    /// `TODO_API_URL` is required; `TODO_HUB_URL`, `TODO_TOKEN_PATH` and
    /// `TODO_REQUEST_TIMEOUT_SECS` are optional.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let api_url = env::var("TODO_API_URL")
            .map_err(|_| Error::config("TODO_API_URL must be set"))?;
        let mut options = Self::new(&api_url);

        if let Ok(hub_url) = env::var("TODO_HUB_URL") {
            options = options.with_hub_url(&hub_url);
        }
        if let Ok(path) = env::var("TODO_TOKEN_PATH") {
            options = options.with_token_storage(TokenStorageKind::File(path.into()));
        }
        if let Ok(secs) = env::var("TODO_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                Error::config(format!("TODO_REQUEST_TIMEOUT_SECS is not a number: {}", secs))
            })?;
            options = options.with_request_timeout(Some(Duration::from_secs(secs)));
        }
        Ok(options)
    }

    /// Set the hub endpoint
    pub fn with_hub_url(mut self, value: &str) -> Self {
        self.hub_url = value.to_string();
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set where the token is persisted
    pub fn with_token_storage(mut self, value: TokenStorageKind) -> Self {
        self.token_storage = value;
        self
    }

    pub fn with_token_key(mut self, value: &str) -> Self {
        self.token_key = value.to_string();
        self
    }

    /// Set whether the push channel reconnects automatically
    pub fn with_auto_reconnect(mut self, value: bool) -> Self {
        self.auto_reconnect = value;
        self
    }

    pub fn with_reconnect_delays(mut self, value: Vec<Duration>) -> Self {
        self.reconnect_delays = value;
        self
    }
}
