//! Account payloads exchanged with the `/account` endpoints

use serde::{Deserialize, Serialize};

/// User returned by login, register, refresh and `GET /account`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub name: String,
    pub email: String,
    /// `GET /account` may omit the token
    #[serde(default)]
    pub token: Option<String>,
}

/// ログイン認証情報
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// ユーザー登録情報
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// The signed-in user of this client instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub email: String,
    pub token: String,
}

impl Session {
    /// Build a session from an account response, falling back to `token`
    /// when the response carries none.
    pub fn from_user(user: AuthUser, fallback_token: Option<String>) -> Option<Self> {
        let token = user.token.or(fallback_token)?;
        Some(Self {
            id: user.id,
            name: user.name,
            email: user.email,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_user_without_token() {
        let user: AuthUser = serde_json::from_value(serde_json::json!({
            "id": "u-1",
            "name": "Ada",
            "email": "ada@example.com"
        }))
        .unwrap();
        assert!(user.token.is_none());

        let session = Session::from_user(user.clone(), Some("stored".to_string())).unwrap();
        assert_eq!(session.token, "stored");
        assert!(Session::from_user(user, None).is_none());
    }
}
