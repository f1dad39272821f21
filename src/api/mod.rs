//! REST client for the platform API
//!
//! Every request carries the bearer token from the [`SessionStore`]. An
//! authorization failure on any endpoint clears the session; that is the only
//! automatic way a session ends besides an explicit logout.

mod auth;

pub use auth::{AuthResponse, AuthService, Credentials, Registration};

use crate::notifications::{Notification, NotificationList};
use crate::session::{ClearReason, SessionError, SessionStore};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not authorized; session cleared")]
    Unauthorized,

    #[error("Request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid API URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// HTTP client bound to one API origin and one session store
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
    session: SessionStore,
}

impl ApiClient {
    /// Create a client for `base_url`
    pub fn new(base_url: &str, session: SessionStore) -> Result<Self, ApiError> {
        let mut base = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl {
                url: base_url.to_string(),
                reason: "URL cannot carry a path".to_string(),
            });
        }
        // Request paths are joined relative to the base, so keep its prefix
        if !base.path().ends_with('/') {
            let prefixed = format!("{}/", base.path());
            base.set_path(&prefixed);
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| ApiError::Transport {
                path: base_url.to_string(),
                source,
            })?;

        Ok(Self {
            http,
            base,
            session,
        })
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .execute::<()>(Method::GET, path, None, None, ClearReason::Unauthorized)
            .await?;
        decode(path, response).await
    }

    /// POST a JSON body to `path` and decode the JSON answer
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .execute(Method::POST, path, Some(body), None, ClearReason::Unauthorized)
            .await?;
        decode(path, response).await
    }

    /// Fetch the latest notifications, newest first
    pub async fn fetch_notifications(&self, limit: usize) -> Result<Vec<Notification>, ApiError> {
        let list: NotificationList = self
            .get_json(&format!("/notifications?limit={}", limit))
            .await?;
        Ok(list.into_vec())
    }

    /// Mark one notification read on the server
    pub async fn mark_notification_read(&self, id: &str) -> Result<(), ApiError> {
        let path = format!("/notifications/{}/read", encode_segment(id));
        self.execute::<()>(Method::POST, &path, None, None, ClearReason::Unauthorized)
            .await?;
        Ok(())
    }

    /// Issue a request. `token` overrides the session token; an authorization
    /// failure clears the session with `on_unauthorized`.
    pub(crate) async fn execute<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        token: Option<&str>,
        on_unauthorized: ClearReason,
    ) -> Result<reqwest::Response, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.base.join(path.trim_start_matches('/')).map_err(|e| ApiError::InvalidUrl {
            url: path.to_string(),
            reason: e.to_string(),
        })?;

        let mut request = self
            .http
            .request(method, url)
            .header("Accept", "application/json");
        let bearer = token.map(str::to_string).or_else(|| self.session.token());
        if let Some(bearer) = bearer {
            request = request.bearer_auth(bearer);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("{} answered 401; clearing session", path);
            self.session.clear(on_unauthorized);
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T, ApiError> {
    response.json().await.map_err(|source| ApiError::Decode {
        path: path.to_string(),
        source,
    })
}

/// Percent-encode a value used as a single path segment
fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[async_trait::async_trait]
impl crate::dashboard::MetricSource for ApiClient {
    async fn fetch(&self, path: &str) -> Result<Value, ApiError> {
        self.get_json(path).await
    }
}
