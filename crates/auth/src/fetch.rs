//! Authenticated HTTP client for the REST API
//!
//! Every request goes through [`ApiClient::execute`], which signs it with the
//! current access token and turns a 401 into one coordinated token refresh
//! followed by a single retry.

use http::{Method, StatusCode};
use log::{debug, error, info, trace, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

use crate::error::AuthError;
use crate::refresh::RefreshCoordinator;
use crate::session::SessionStore;
use crate::token::TokenStore;
use crate::types::{AuthUser, Session};

const REFRESH_PATH: &str = "/account/refreshToken";

/// Transient, non-blocking notification for whatever renders the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The refresh failed and the user was signed out
    SessionExpired,
    BadRequest(String),
    Forbidden,
    NotFound,
    ServerError(u16),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionExpired => write!(f, "Session expired. Please login again."),
            Self::BadRequest(message) => write!(f, "{}", message),
            Self::Forbidden => write!(f, "Error 403: Forbidden"),
            Self::NotFound => write!(f, "Error 404: Not Found"),
            Self::ServerError(status) => write!(f, "Error {}: Server error", status),
        }
    }
}

struct Inner {
    base_url: String,
    http: Client,
    tokens: TokenStore,
    session: SessionStore,
    refresh: RefreshCoordinator,
    notices: broadcast::Sender<Notice>,
}

/// REST client shared by the session and todo stores
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        http: Client,
        tokens: TokenStore,
        session: SessionStore,
    ) -> Result<Self, AuthError> {
        // reject malformed base URLs up front
        Url::parse(base_url)?;
        let (notices, _) = broadcast::channel(32);
        Ok(Self {
            inner: Arc::new(Inner {
                base_url: base_url.trim_end_matches('/').to_string(),
                http,
                tokens,
                session,
                refresh: RefreshCoordinator::new(),
                notices,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    pub fn session(&self) -> &SessionStore {
        &self.inner.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.refresh
    }

    /// Receiver for notifications emitted from now on
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    pub fn get(&self, path: &str) -> ApiRequest<'_> {
        ApiRequest::new(self, Method::GET, path)
    }

    pub fn post(&self, path: &str) -> ApiRequest<'_> {
        ApiRequest::new(self, Method::POST, path)
    }

    pub fn put(&self, path: &str) -> ApiRequest<'_> {
        ApiRequest::new(self, Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> ApiRequest<'_> {
        ApiRequest::new(self, Method::DELETE, path)
    }

    /// Refresh the access token, sharing an in-flight refresh if there is one.
    ///
    /// On failure the token and session are cleared and
    /// [`Notice::SessionExpired`] is emitted once.
    pub async fn refresh_access_token(&self) -> Result<String, AuthError> {
        self.inner.refresh.run(|| self.refresh_and_store()).await
    }

    async fn refresh_and_store(&self) -> Result<String, AuthError> {
        info!("Refreshing access token");
        match self.request_refresh().await {
            Ok(session) => {
                let token = session.token.clone();
                self.inner.tokens.set(Some(token.clone()));
                self.inner.session.set(session);
                info!("Access token refreshed");
                Ok(token)
            }
            Err(e) => {
                error!("Refresh token failed, logging out: {}", e);
                self.inner.tokens.clear();
                self.inner.session.clear();
                self.notify(Notice::SessionExpired);
                Err(AuthError::SessionExpired(e.to_string()))
            }
        }
    }

    async fn request_refresh(&self) -> Result<Session, AuthError> {
        // the refresh token travels in the cookie jar; sent directly so a 401
        // here can never loop back into another refresh
        let request = self
            .post(REFRESH_PATH)
            .credentials()
            .json(&serde_json::json!({}))?;
        let token = self.inner.tokens.get();
        let response = self.send_once(&request, token.as_deref()).await?;
        if !response.status().is_success() {
            return Err(self.failure(&request, response).await);
        }
        let user: AuthUser = response.json().await?;
        Session::from_user(user, None).ok_or(AuthError::MissingToken)
    }

    async fn execute(&self, request: &ApiRequest<'_>) -> Result<Response, AuthError> {
        let mut token = self.inner.tokens.get();
        let mut retried = false;

        loop {
            let response = self.send_once(request, token.as_deref()).await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::UNAUTHORIZED && !request.credentials {
                if retried {
                    warn!(
                        "{} {} still unauthorized after token refresh",
                        request.method, request.path
                    );
                    return Err(AuthError::Unauthorized);
                }
                retried = true;
                token = Some(self.token_for_retry(token.as_deref()).await?);
                debug!("Retrying {} {} with refreshed token", request.method, request.path);
                continue;
            }

            return Err(self.failure(request, response).await);
        }
    }

    async fn token_for_retry(&self, rejected: Option<&str>) -> Result<String, AuthError> {
        if let Some(current) = self.inner.tokens.get() {
            if rejected != Some(current.as_str()) {
                debug!("Token rotated while the request was in flight, reusing it");
                return Ok(current);
            }
        }
        self.refresh_access_token().await
    }

    async fn send_once(
        &self,
        request: &ApiRequest<'_>,
        token: Option<&str>,
    ) -> Result<Response, AuthError> {
        let url = format!("{}{}", self.inner.base_url, request.path);
        trace!("{} {} (token: {})", request.method, url, token.is_some());

        let mut builder = self
            .inner
            .http
            .request(request.method.clone(), &url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder.send().await?)
    }

    async fn failure(&self, request: &ApiRequest<'_>, response: Response) -> AuthError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        error!(
            "{} {} failed with status {}: {}",
            request.method, request.path, status, message
        );

        if request.credentials
            && (status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED)
        {
            let message = if message.is_empty() {
                status.to_string()
            } else {
                message
            };
            return AuthError::InvalidCredentials {
                status: status.as_u16(),
                message,
            };
        }

        let notice = match status {
            StatusCode::BAD_REQUEST => Some(Notice::BadRequest(bad_request_text(&message))),
            StatusCode::FORBIDDEN => Some(Notice::Forbidden),
            StatusCode::NOT_FOUND => Some(Notice::NotFound),
            s if s.is_server_error() => Some(Notice::ServerError(s.as_u16())),
            _ => None,
        };
        if let Some(notice) = notice {
            self.notify(notice);
        }

        AuthError::Api {
            status: status.as_u16(),
            message,
        }
    }

    fn notify(&self, notice: Notice) {
        // no subscribers is fine
        let _ = self.inner.notices.send(notice);
    }
}

/// Plain-string bodies are shown as-is, structured ones collapse to "Bad Request"
fn bad_request_text(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(text)) => text,
        Ok(_) => "Bad Request".to_string(),
        Err(_) if body.trim().is_empty() => "Bad Request".to_string(),
        Err(_) => body.to_string(),
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url)
            .field("tokens", &self.inner.tokens)
            .finish()
    }
}

/// A request that can be replayed after a token refresh
pub struct ApiRequest<'a> {
    client: &'a ApiClient,
    method: Method,
    path: String,
    body: Option<Vec<u8>>,
    credentials: bool,
}

impl<'a> ApiRequest<'a> {
    fn new(client: &'a ApiClient, method: Method, path: &str) -> Self {
        Self {
            client,
            method,
            path: path.to_string(),
            body: None,
            credentials: false,
        }
    }

    /// Add a JSON body to the request
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, AuthError> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    /// Mark as a credential exchange: a 401 is reported as bad credentials
    /// instead of triggering a token refresh.
    pub fn credentials(mut self) -> Self {
        self.credentials = true;
        self
    }

    /// Execute the request and parse the response as JSON
    pub async fn send_json<T: DeserializeOwned>(self) -> Result<T, AuthError> {
        let response = self.client.execute(&self).await?;
        Ok(response.json::<T>().await?)
    }

    /// Execute the request, discarding any response body
    pub async fn send_empty(self) -> Result<(), AuthError> {
        self.client.execute(&self).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, token: Option<&str>) -> ApiClient {
        let tokens = TokenStore::in_memory();
        tokens.set(token.map(str::to_string));
        ApiClient::new(&server.uri(), Client::new(), tokens, SessionStore::new()).unwrap()
    }

    #[test]
    fn test_bad_request_text() {
        assert_eq!(bad_request_text("\"Title is required\""), "Title is required");
        assert_eq!(bad_request_text("{\"errors\":{}}"), "Bad Request");
        assert_eq!(bad_request_text(""), "Bad Request");
        assert_eq!(bad_request_text("plain failure"), "plain failure");
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/todoitems"))
            .and(header("Authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let api = client_for(&server, Some("abc"));
        let items: Vec<serde_json::Value> = api.get("/todoitems").send_json().await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_not_found_emits_notice() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/todoitems/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = client_for(&server, Some("abc"));
        let mut notices = api.notices();
        let err = api.get("/todoitems/9").send_empty().await.unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert_eq!(notices.recv().await.unwrap(), Notice::NotFound);
    }

    #[tokio::test]
    async fn test_credentials_request_does_not_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/account/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let api = client_for(&server, None);
        let err = api
            .post("/account/login")
            .credentials()
            .send_empty()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials { .. }));
    }
}
