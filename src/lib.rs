//! todo-sync client library
//!
//! A client for a todo list that stays in sync across every signed-in
//! session: REST calls for changes, a hub push channel for other sessions'
//! changes, and an access token that is refreshed once, transparently, no
//! matter how many requests find it expired.

pub mod config;
pub mod error;
pub mod todos;

pub use todo_sync_auth as auth;
pub use todo_sync_realtime as realtime;

use log::{debug, info};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auth::{
    ApiClient, Auth, FileTokenStorage, MemoryTokenStorage, Notice, Session, SessionStore,
    TokenStorage, TokenStore,
};
use crate::config::{ClientOptions, TokenStorageKind};
use crate::error::{Error, Result};
use crate::realtime::HubClientOptions;
use crate::todos::TodoStore;

/// The main entry point for the todo-sync client
#[derive(Debug, Clone)]
pub struct TodoClient {
    /// Client options
    pub options: ClientOptions,
    auth: Auth,
    todos: TodoStore,
}

impl TodoClient {
    /// Create a new client
    ///
    /// # Example
    ///
    /// ```
    /// use todo_sync::{TodoClient, config::ClientOptions};
    ///
    /// let client = TodoClient::new(ClientOptions::new("https://localhost:7069/api")).unwrap();
    /// assert!(!client.auth().is_authenticated());
    /// ```
    pub fn new(options: ClientOptions) -> Result<Self> {
        let mut builder = Client::builder().cookie_store(true);
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        let storage: Arc<dyn TokenStorage> = match &options.token_storage {
            TokenStorageKind::Memory => Arc::new(MemoryTokenStorage::new()),
            TokenStorageKind::File(path) => Arc::new(FileTokenStorage::new(path.clone())),
        };
        let tokens = TokenStore::new(storage, &options.token_key);
        let api = ApiClient::new(&options.api_url, http, tokens, SessionStore::new())?;

        let hub_options = HubClientOptions {
            auto_reconnect: options.auto_reconnect,
            reconnect_delays: options.reconnect_delays.clone(),
            ..Default::default()
        };
        let todos = TodoStore::new(api.clone(), &options.hub_url, hub_options);

        debug!("Created client for {}", options.api_url);
        Ok(Self {
            options,
            auth: Auth::new(api),
            todos,
        })
    }

    /// Create a client from `TODO_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ClientOptions::from_env()?)
    }

    /// Session operations: login, register, refresh, logout
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// The todo list mirror
    pub fn todos(&self) -> &TodoStore {
        &self.todos
    }

    /// Transient notices (expired session, rejected requests)
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.auth.api().notices()
    }

    /// Load the list and open the push channel for the signed-in user
    pub async fn start_session(&self) -> Result<()> {
        if !self.auth.is_authenticated() {
            return Err(Error::MissingSession);
        }
        self.todos.load_all().await?;
        self.todos.connect_push().await
    }

    /// Sign in and start the session
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.auth.login(email, password).await?;
        self.start_session().await?;
        Ok(session)
    }

    /// Pick up the persisted session, as on an application restart
    pub async fn restore(&self) -> Result<Option<Session>> {
        match self.auth.restore().await {
            Some(session) => {
                self.start_session().await?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Sign out locally, close the push channel and forget the list
    pub async fn logout(&self) {
        self.todos.disconnect_push().await;
        self.todos.clear();
        self.auth.logout();
        info!("Session ended");
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::auth::{Notice, Session};
    pub use crate::config::{ClientOptions, TokenStorageKind};
    pub use crate::error::{Error, Result};
    pub use crate::todos::{CreateTodoItem, TodoItem};
    pub use crate::TodoClient;
}
