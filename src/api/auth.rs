//! Login, registration, logout and session validation

use super::{ApiClient, ApiError};
use crate::session::{ClearReason, Session, User};
use reqwest::Method;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub full_name: String,
}

/// Answer of the login and registration endpoints.
/// Some deployments only return the token, or the token plus a bare user id.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(alias = "access_token")]
    pub token: String,

    #[serde(default)]
    pub user: Option<User>,

    #[serde(default)]
    pub user_id: Option<String>,
}

/// Authentication flows; every outcome is recorded in the session store
#[derive(Debug, Clone)]
pub struct AuthService {
    api: ApiClient,
}

impl AuthService {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<Session, ApiError> {
        let response: AuthResponse = self.api.post_json("/auth/login", credentials).await?;
        self.establish(response).await
    }

    pub async fn register(&self, registration: &Registration) -> Result<Session, ApiError> {
        let response: AuthResponse = self.api.post_json("/auth/register", registration).await?;
        self.establish(response).await
    }

    /// Explicit logout. Idempotent.
    pub fn logout(&self) {
        self.api.session().clear(ClearReason::Logout);
    }

    /// Check a restored session against the server. Returns `None` (and
    /// clears the store) when the server no longer accepts the token.
    pub async fn validate(&self) -> Result<Option<User>, ApiError> {
        if !self.api.session().is_authenticated() {
            return Ok(None);
        }
        match self.fetch_profile(None, ClearReason::Expired).await {
            Ok(user) => Ok(Some(user)),
            Err(ApiError::Unauthorized) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn establish(&self, response: AuthResponse) -> Result<Session, ApiError> {
        let user = match response.user {
            Some(user) => user,
            None => {
                tracing::debug!("Auth response carried no profile; fetching /auth/me");
                self.fetch_profile(Some(&response.token), ClearReason::Unauthorized)
                    .await?
            }
        };
        let user = match (user.id.is_empty(), response.user_id) {
            (true, Some(id)) => User { id, ..user },
            _ => user,
        };
        Ok(self.api.session().set_session(response.token, user)?)
    }

    async fn fetch_profile(
        &self,
        token: Option<&str>,
        on_unauthorized: ClearReason,
    ) -> Result<User, ApiError> {
        let response = self
            .api
            .execute::<()>(Method::GET, "/auth/me", None, token, on_unauthorized)
            .await?;
        super::decode("/auth/me", response).await
    }
}
