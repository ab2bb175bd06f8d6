//! Session store and account operations

use log::{debug, error, info};
use std::sync::{Arc, RwLock};

use crate::error::AuthError;
use crate::fetch::ApiClient;
use crate::types::{AuthUser, LoginRequest, RegisterRequest, Session};

/// Holds the single active session of a client instance
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    current: Arc<RwLock<Option<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Session> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, session: Session) {
        self.replace(Some(session));
    }

    pub fn clear(&self) {
        self.replace(None);
    }

    pub fn user_id(&self) -> Option<String> {
        self.get().map(|s| s.id)
    }

    pub fn is_active(&self) -> bool {
        self.get().is_some()
    }

    fn replace(&self, session: Option<Session>) {
        match self.current.write() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }
}

/// Account operations: login, register, current user, refresh, logout
#[derive(Debug, Clone)]
pub struct Auth {
    api: ApiClient,
}

impl Auth {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// メール・パスワードでログイン
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let payload = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let user: AuthUser = self
            .api
            .post("/account/login")
            .credentials()
            .json(&payload)?
            .send_json()
            .await?;
        let session = self.start(user)?;
        info!("Logged in as {}", session.email);
        Ok(session)
    }

    /// ユーザー登録
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let payload = RegisterRequest {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        let user: AuthUser = self
            .api
            .post("/account/register")
            .credentials()
            .json(&payload)?
            .send_json()
            .await?;
        let session = self.start(user)?;
        info!("Registered {}", session.email);
        Ok(session)
    }

    /// Fetch the signed-in user; an expired token is refreshed on the way
    pub async fn current_user(&self) -> Result<Session, AuthError> {
        let user: AuthUser = self.api.get("/account").send_json().await?;
        let session = Session::from_user(user, self.api.tokens().get())
            .ok_or(AuthError::MissingSession)?;
        self.api.session().set(session.clone());
        Ok(session)
    }

    /// Rebuild the session from the persisted token, as on a page reload.
    ///
    /// An unusable token is removed and `None` returned.
    pub async fn restore(&self) -> Option<Session> {
        let token = self.api.tokens().restore()?;
        debug!("Found persisted token ({} chars), loading user", token.len());
        match self.current_user().await {
            Ok(session) => {
                info!("Restored session for {}", session.email);
                Some(session)
            }
            Err(e) => {
                error!("Failed to load user: {}", e);
                self.logout();
                None
            }
        }
    }

    /// Mint a new access token from the refresh cookie.
    ///
    /// Shares any refresh already in flight; failure signs the user out.
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        self.api.refresh_access_token().await?;
        self.api.session().get().ok_or(AuthError::MissingSession)
    }

    /// Local sign-out: forget the token (including the persisted copy) and session
    pub fn logout(&self) {
        self.api.tokens().clear();
        self.api.session().clear();
        info!("Logged out");
    }

    pub fn session(&self) -> Option<Session> {
        self.api.session().get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.api.session().is_active()
    }

    pub fn token(&self) -> Option<String> {
        self.api.tokens().get()
    }

    fn start(&self, user: AuthUser) -> Result<Session, AuthError> {
        let session = Session::from_user(user, None).ok_or(AuthError::MissingToken)?;
        self.api.tokens().set(Some(session.token.clone()));
        self.api.session().set(session.clone());
        Ok(session)
    }
}
