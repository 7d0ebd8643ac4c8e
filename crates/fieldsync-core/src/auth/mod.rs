//! Operator session storage read by outgoing sync requests.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::unix_millis_now;

const EXPIRY_SKEW_MILLIS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub jde_no: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    /// Unix ms; `None` for tokens without a known expiry.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl AuthSession {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        let horizon = unix_millis_now() + EXPIRY_SKEW_MILLIS;
        self.expires_at.is_some_and(|expires_at| expires_at <= horizon)
    }

    /// Token suitable for an `Authorization: Bearer` header.
    pub fn bearer_token(&self) -> Option<&str> {
        let token = self.access_token.trim();
        (!token.is_empty()).then_some(token)
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthSession")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Failed to parse session payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Secure storage error: {0}")]
    SecureStorage(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Where the current session lives. Implementations are read on every
/// outgoing request, so a re-login is picked up by the next POST.
pub trait SessionPersistence: Clone + Send + Sync + 'static {
    fn load(&self) -> AuthResult<Option<AuthSession>>;
    fn save(&self, session: &AuthSession) -> AuthResult<()>;
    fn clear(&self) -> AuthResult<()>;
}

/// Shared in-process session; clones observe each other's updates.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    session: Arc<RwLock<Option<AuthSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: AuthSession) -> Self {
        Self {
            session: Arc::new(RwLock::new(Some(session))),
        }
    }
}

impl SessionPersistence for MemorySessionStore {
    fn load(&self) -> AuthResult<Option<AuthSession>> {
        self.session
            .read()
            .map(|session| session.clone())
            .map_err(|_| AuthError::SecureStorage("session lock poisoned".to_string()))
    }

    fn save(&self, session: &AuthSession) -> AuthResult<()> {
        let mut guard = self
            .session
            .write()
            .map_err(|_| AuthError::SecureStorage("session lock poisoned".to_string()))?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> AuthResult<()> {
        let mut guard = self
            .session
            .write()
            .map_err(|_| AuthError::SecureStorage("session lock poisoned".to_string()))?;
        *guard = None;
        Ok(())
    }
}

/// Load the bearer token for one request.
///
/// Expired sessions still send their token; the server decides, and a
/// rejected entry stays queued until the operator signs in again.
pub fn current_bearer_token<P: SessionPersistence>(store: &P) -> AuthResult<Option<String>> {
    let Some(session) = store.load()? else {
        return Ok(None);
    };
    if session.is_expired() {
        tracing::debug!("Using expired session token for user {}", session.user.id);
    }
    Ok(session.bearer_token().map(ToOwned::to_owned))
}
