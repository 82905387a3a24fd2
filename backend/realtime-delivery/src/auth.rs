use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The signed-in user as known to the auth collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub user_id: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Source of the current session; the token feeds the socket URL, the
/// `auth` frame and the REST `Authorization` header.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_session(&self) -> Option<AuthSession>;
}

/// Fixed session, for probes and tests
#[derive(Debug, Clone)]
pub struct StaticAuth {
    session: Option<AuthSession>,
}

impl StaticAuth {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            session: Some(AuthSession {
                user_id: user_id.into(),
                token: token.into(),
                expires_at: None,
            }),
        }
    }

    pub fn signed_out() -> Self {
        Self { session: None }
    }

    pub fn with_session(session: AuthSession) -> Self {
        Self {
            session: Some(session),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_session(&self) -> Option<AuthSession> {
        self.session.clone()
    }
}
