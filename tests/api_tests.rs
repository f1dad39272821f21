//! Integration tests for the REST client and authentication flows

mod common;

use common::mock_api::{self, MockApi, PASSWORD, TOKEN};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use threatlink::api::{ApiClient, ApiError, AuthService, Credentials, Registration};
use threatlink::session::{ClearReason, Role, SessionEvent, SessionStore, User};

async fn setup() -> (Arc<MockApi>, ApiClient) {
    let mock = Arc::new(MockApi::default());
    let base = mock_api::spawn(mock.clone()).await;
    let api = ApiClient::new(&base, SessionStore::in_memory()).unwrap();
    (mock, api)
}

fn credentials(password: &str) -> Credentials {
    Credentials {
        email: "alice@example.com".to_string(),
        password: password.to_string(),
    }
}

#[tokio::test]
async fn test_login_fetches_profile_when_response_has_no_user() -> anyhow::Result<()> {
    let (mock, api) = setup().await;
    mock.admin.store(true, Ordering::SeqCst);
    let auth = AuthService::new(api.clone());

    let session = auth.login(&credentials(PASSWORD)).await?;

    assert_eq!(session.token(), TOKEN);
    assert_eq!(session.user().id, "u1");
    assert_eq!(session.user().display_name, "Alice Analyst");
    assert_eq!(session.role(), Role::Admin);
    assert_eq!(mock.me_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.session().get_session(), Some(session));
    Ok(())
}

#[tokio::test]
async fn test_login_with_wrong_password_leaves_no_session() {
    let (_mock, api) = setup().await;
    let auth = AuthService::new(api.clone());

    let result = auth.login(&credentials("wrong")).await;

    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert!(!api.session().is_authenticated());
}

#[tokio::test]
async fn test_register_uses_returned_profile() -> anyhow::Result<()> {
    let (mock, api) = setup().await;
    let auth = AuthService::new(api.clone());

    let session = auth
        .register(&Registration {
            email: "bob@example.com".to_string(),
            password: PASSWORD.to_string(),
            full_name: "Bob Builder".to_string(),
        })
        .await?;

    assert_eq!(session.user().id, "u2");
    assert_eq!(session.user().display_name, "Bob Builder");
    assert_eq!(session.role(), Role::Member);
    assert_eq!(mock.me_calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_any_unauthorized_response_clears_session() -> anyhow::Result<()> {
    let (mock, api) = setup().await;
    api.session()
        .set_session(TOKEN, User::new("u1", "Alice", Role::Member))?;
    let mut events = api.session().subscribe();

    let stats: Value = api.get_json("/dashboard/stats").await?;
    assert_eq!(stats["total_threats"], 120);

    mock.revoke();
    let result = api.get_json::<Value>("/dashboard/stats").await;

    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert!(!api.session().is_authenticated());
    assert_eq!(api.session().token(), None);
    assert_eq!(
        events.recv().await?,
        SessionEvent::Cleared {
            reason: ClearReason::Unauthorized
        }
    );

    // Already cleared: a second 401 publishes nothing
    let _ = api.get_json::<Value>("/dashboard/stats").await;
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_validate_rejects_expired_token() -> anyhow::Result<()> {
    let (_mock, api) = setup().await;
    api.session()
        .set_session("stale-token", User::new("u1", "Alice", Role::Member))?;
    let mut events = api.session().subscribe();
    let auth = AuthService::new(api.clone());

    assert_eq!(auth.validate().await?, None);
    assert!(!api.session().is_authenticated());
    assert_eq!(
        events.recv().await?,
        SessionEvent::Cleared {
            reason: ClearReason::Expired
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_validate_accepts_live_token() -> anyhow::Result<()> {
    let (_mock, api) = setup().await;
    api.session()
        .set_session(TOKEN, User::new("u1", "Alice", Role::Member))?;
    let auth = AuthService::new(api.clone());

    let user = auth.validate().await?.expect("token is valid");
    assert_eq!(user.id, "u1");
    assert!(api.session().is_authenticated());

    auth.logout();
    auth.logout();
    assert_eq!(auth.validate().await?, None);
    Ok(())
}

#[tokio::test]
async fn test_notifications_fetch_and_mark_read() -> anyhow::Result<()> {
    let (mock, api) = setup().await;
    api.session()
        .set_session(TOKEN, User::new("u1", "Alice", Role::Member))?;

    let notifications = api.fetch_notifications(20).await?;
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications[0].id, "n1");
    assert!(!notifications[0].read);
    assert!(notifications[1].read);

    api.mark_notification_read("n1").await?;
    api.mark_notification_read("id with/slash").await?;
    assert_eq!(mock.read_ids(), vec!["n1", "id with/slash"]);
    Ok(())
}

#[tokio::test]
async fn test_server_error_keeps_session() -> anyhow::Result<()> {
    let (_mock, api) = setup().await;
    api.session()
        .set_session(TOKEN, User::new("u1", "Alice", Role::Member))?;

    let result = api.get_json::<Value>("/broken").await;

    match result {
        Err(ApiError::Status { status, body, .. }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "database unavailable");
        }
        other => panic!("expected a status error, got {:?}", other),
    }
    assert!(api.session().is_authenticated());
    Ok(())
}

#[tokio::test]
async fn test_unreachable_server_is_a_transport_error() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let store = SessionStore::in_memory();
    store.set_session(TOKEN, User::new("u1", "Alice", Role::Member))?;
    let api = ApiClient::new(&format!("http://{}/api", addr), store.clone())?;

    let result = api.get_json::<Value>("/dashboard/stats").await;
    assert!(matches!(result, Err(ApiError::Transport { .. })));
    assert!(store.is_authenticated());
    Ok(())
}
