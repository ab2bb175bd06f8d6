use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use todo_sync_auth::{
    ApiClient, Auth, AuthError, FileTokenStorage, Notice, SessionStore, TokenStorage, TokenStore,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn auth_with(server: &MockServer, tokens: TokenStore) -> Auth {
    let api = ApiClient::new(&server.uri(), Client::new(), tokens, SessionStore::new()).unwrap();
    Auth::new(api)
}

fn account(token: &str) -> serde_json::Value {
    json!({
        "id": "user-1",
        "name": "Ada",
        "email": "ada@example.com",
        "token": token
    })
}

async fn count_requests(server: &MockServer, target: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == target)
        .count()
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_refresh_once() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/todoitems"))
        .and(header("Authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/todoitems"))
        .and(header("Authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/account/refreshToken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(account("fresh"))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let tokens = TokenStore::in_memory();
    tokens.set(Some("stale".to_string()));
    let auth = auth_with(&server, tokens);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let api = auth.api().clone();
        handles.push(tokio::spawn(async move {
            api.get("/todoitems")
                .send_json::<Vec<serde_json::Value>>()
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(count_requests(&server, "/account/refreshToken").await, 1);
    assert_eq!(auth.token().as_deref(), Some("fresh"));
    assert_eq!(auth.session().unwrap().id, "user-1");
    assert!(!auth.api().coordinator().is_refreshing());
}

#[tokio::test]
async fn test_request_is_retried_only_once() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/todoitems"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/account/refreshToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account("still-rejected")))
        .mount(&server)
        .await;

    let tokens = TokenStore::in_memory();
    tokens.set(Some("stale".to_string()));
    let auth = auth_with(&server, tokens);

    let err = auth.api().get("/todoitems").send_empty().await.unwrap_err();

    assert!(matches!(err, AuthError::Unauthorized));
    assert_eq!(count_requests(&server, "/todoitems").await, 2);
    assert_eq!(count_requests(&server, "/account/refreshToken").await, 1);
}

#[tokio::test]
async fn test_refresh_failure_logs_out_and_notifies() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/todoitems"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/account/refreshToken"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileTokenStorage::new(dir.path().join("tokens.json")));
    let tokens = TokenStore::new(storage.clone(), "jwt");
    tokens.set(Some("stale".to_string()));
    let auth = auth_with(&server, tokens);
    let mut notices = auth.api().notices();

    let first = {
        let api = auth.api().clone();
        tokio::spawn(async move { api.get("/todoitems").send_empty().await })
    };
    let second = {
        let api = auth.api().clone();
        tokio::spawn(async move { api.get("/todoitems").send_empty().await })
    };

    assert!(matches!(first.await.unwrap(), Err(AuthError::SessionExpired(_))));
    assert!(matches!(second.await.unwrap(), Err(AuthError::SessionExpired(_))));
    assert_eq!(count_requests(&server, "/account/refreshToken").await, 1);

    assert!(auth.token().is_none());
    assert!(!auth.is_authenticated());
    assert!(storage.load("jwt").unwrap().is_none());

    assert_eq!(notices.recv().await.unwrap(), Notice::SessionExpired);
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn test_login_persists_and_reload_restores() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/account/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account("login-token")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/account"))
        .and(header("Authorization", "Bearer login-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "user-1",
            "name": "Ada",
            "email": "ada@example.com"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("tokens.json");

    let first = auth_with(
        &server,
        TokenStore::new(Arc::new(FileTokenStorage::new(&file)), "jwt"),
    );
    let session = first.login("ada@example.com", "secret1").await.unwrap();
    assert_eq!(session.token, "login-token");

    // a fresh instance on the same storage, as after a reload
    let reloaded = auth_with(
        &server,
        TokenStore::new(Arc::new(FileTokenStorage::new(&file)), "jwt"),
    );
    assert!(!reloaded.is_authenticated());

    let restored = reloaded.restore().await.unwrap();
    assert_eq!(restored.email, "ada@example.com");
    assert_eq!(restored.token, "login-token");
    assert!(reloaded.is_authenticated());
}

#[tokio::test]
async fn test_restore_with_expired_token_refreshes() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/account"))
        .and(header("Authorization", "Bearer expired"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/account"))
        .and(header("Authorization", "Bearer renewed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account("renewed")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/account/refreshToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account("renewed")))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = TokenStore::in_memory();
    tokens.set(Some("expired".to_string()));
    let auth = auth_with(&server, tokens);

    let restored = auth.restore().await.unwrap();
    assert_eq!(restored.token, "renewed");
}

#[tokio::test]
async fn test_explicit_refresh_failure_logs_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/account/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(account("t1")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/account/refreshToken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let auth = auth_with(&server, TokenStore::in_memory());
    auth.login("ada@example.com", "secret1").await.unwrap();

    let err = auth.refresh().await.unwrap_err();
    assert!(matches!(err, AuthError::SessionExpired(_)));
    assert!(!auth.is_authenticated());
    assert!(auth.token().is_none());
}
