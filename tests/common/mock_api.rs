//! In-process stand-in for the platform REST API

use axum::extract::{Path, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const TOKEN: &str = "tok-1";
pub const PASSWORD: &str = "hunter2";

#[derive(Default)]
pub struct MockApi {
    /// Every authenticated endpoint answers 401 once set
    pub revoked: AtomicBool,
    /// `/auth/me` reports an admin
    pub admin: AtomicBool,
    pub me_calls: AtomicU32,
    pub read_ids: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn read_ids(&self) -> Vec<String> {
        self.read_ids.lock().unwrap().clone()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        !self.revoked.load(Ordering::SeqCst) && bearer == Some(TOKEN)
    }

    fn guarded(&self, headers: &HeaderMap, body: Value) -> Response {
        if self.authorized(headers) {
            Json(body).into_response()
        } else {
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "Could not validate credentials"})),
    )
        .into_response()
}

type Shared = State<Arc<MockApi>>;

async fn login(Json(body): Json<Value>) -> Response {
    if body["password"] == PASSWORD {
        Json(json!({"token": TOKEN})).into_response()
    } else {
        unauthorized()
    }
}

async fn register(Json(body): Json<Value>) -> Response {
    Json(json!({
        "token": TOKEN,
        "user": {"_id": "u2", "full_name": body["full_name"], "role": "user"}
    }))
    .into_response()
}

async fn me(State(api): Shared, headers: HeaderMap) -> Response {
    api.me_calls.fetch_add(1, Ordering::SeqCst);
    let role = if api.admin.load(Ordering::SeqCst) {
        "admin"
    } else {
        "user"
    };
    api.guarded(
        &headers,
        json!({"_id": "u1", "full_name": "Alice Analyst", "email": "alice@example.com", "role": role}),
    )
}

async fn notifications(State(api): Shared, headers: HeaderMap) -> Response {
    api.guarded(
        &headers,
        json!({"notifications": [
            {"id": "n1", "message": "Your report was approved", "type": "info",
             "timestamp": "2024-03-12T10:15:30.123456", "read": false},
            {"id": "n2", "message": "Scan finished", "type": "info",
             "timestamp": "2024-03-11T08:00:00", "read": true}
        ]}),
    )
}

async fn mark_read(State(api): Shared, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !api.authorized(&headers) {
        return unauthorized();
    }
    api.read_ids.lock().unwrap().push(id);
    Json(json!({"message": "Notification marked as read"})).into_response()
}

async fn stats(State(api): Shared, headers: HeaderMap) -> Response {
    api.guarded(
        &headers,
        json!({
            "total_threats": 120,
            "recent_threats": 7,
            "severity_distribution": {"critical": 3, "high": 20},
            "type_distribution": {"phishing": 60}
        }),
    )
}

async fn user_stats(State(api): Shared, headers: HeaderMap) -> Response {
    api.guarded(&headers, json!({"total_submitted": 4}))
}

async fn threats(State(api): Shared, headers: HeaderMap) -> Response {
    api.guarded(
        &headers,
        json!([{"id": "t1", "title": "Credential phishing", "severity": "high"}]),
    )
}

async fn admin_overview(State(api): Shared, headers: HeaderMap) -> Response {
    api.guarded(&headers, json!({"pending": 2, "users": 9}))
}

async fn broken() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable").into_response()
}

/// Serve the mock on an ephemeral port; returns the API base URL
pub async fn spawn(api: Arc<MockApi>) -> String {
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/register", post(register))
        .route("/api/auth/me", get(me))
        .route("/api/notifications", get(notifications))
        .route("/api/notifications/:id/read", post(mark_read))
        .route("/api/dashboard/stats", get(stats))
        .route("/api/dashboard/user-stats", get(user_stats))
        .route("/api/threats", get(threats))
        .route("/api/admin/stats/overview", get(admin_overview))
        .route("/api/broken", get(broken))
        .with_state(api);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/api", addr)
}
