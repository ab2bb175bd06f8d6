//! Authentication for todo-sync
//!
//! This crate provides the session side of the client: the persisted access
//! token, the account operations (login, register, current user, refresh,
//! logout) and the REST client that transparently refreshes an expired token
//! exactly once no matter how many requests hit the 401 at the same time.

mod error;
mod fetch;
mod refresh;
mod session;
mod token;
mod types;

pub use error::AuthError;
pub use fetch::{ApiClient, ApiRequest, Notice};
pub use refresh::RefreshCoordinator;
pub use session::{Auth, SessionStore};
pub use token::{
    FileTokenStorage, MemoryTokenStorage, TokenAccessor, TokenStorage, TokenStore,
    DEFAULT_TOKEN_KEY,
};
pub use types::{AuthUser, LoginRequest, RegisterRequest, Session};
