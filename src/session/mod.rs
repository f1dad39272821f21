//! Session management - the single source of truth for who is logged in
//!
//! Every read and write of the token goes through [`SessionStore`]. The store
//! keeps the current session in memory, mirrors it to a [`SessionStorage`]
//! backend so a restart restores it, and announces changes on a broadcast bus.

mod storage;

pub use storage::{FileStorage, MemoryStorage, SessionStorage, SESSION_KEY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session storage I/O failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Stored session record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Refusing to store an empty token")]
    EmptyToken,

    #[error("Refusing to store a user without an id")]
    MissingUserId,
}

/// Access level of an authenticated user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    #[serde(alias = "user")]
    Member,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Member => write!(f, "member"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// Minimal user profile kept alongside the token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(alias = "_id", alias = "user_id")]
    pub id: String,

    #[serde(default, alias = "full_name", alias = "username")]
    pub display_name: String,

    #[serde(default)]
    pub role: Role,
}

impl User {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }
}

/// An authenticated identity: token and user always travel together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    token: String,
    user: User,
    established_at: DateTime<Utc>,
}

impl Session {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn role(&self) -> Role {
        self.user.role
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

/// A usable session has a non-blank token and a user id
fn check_identity(token: &str, user: &User) -> Result<(), SessionError> {
    if token.trim().is_empty() {
        return Err(SessionError::EmptyToken);
    }
    if user.id.trim().is_empty() {
        return Err(SessionError::MissingUserId);
    }
    Ok(())
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// Explicit logout
    Logout,
    /// A REST call came back with an authorization failure
    Unauthorized,
    /// The server no longer recognises the restored token
    Expired,
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established { user_id: String },
    Cleared { reason: ClearReason },
}

struct StoreInner {
    current: RwLock<Option<Session>>,
    /// Serializes writers so the persisted record and memory never disagree
    write_lock: Mutex<()>,
    storage: Box<dyn SessionStorage>,
    events: broadcast::Sender<SessionEvent>,
}

/// Shared handle to the session; clones see the same state
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl SessionStore {
    /// Open a store over `storage`, restoring a previously persisted session.
    /// An unreadable record is discarded and the store starts unauthenticated.
    pub fn open(storage: impl SessionStorage + 'static) -> Self {
        let loaded = storage.load().and_then(|session| match session {
            Some(session) => check_identity(&session.token, &session.user).map(|_| Some(session)),
            None => Ok(None),
        });
        let restored = match loaded {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Discarding unreadable session record: {}", e);
                if let Err(e) = storage.remove() {
                    tracing::error!("Failed to remove session record: {}", e);
                }
                None
            }
        };
        if let Some(session) = &restored {
            tracing::info!("Restored session for user {}", session.user.id);
        }

        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(restored),
                write_lock: Mutex::new(()),
                storage: Box::new(storage),
                events,
            }),
        }
    }

    /// Store that forgets everything when the process exits
    pub fn in_memory() -> Self {
        Self::open(MemoryStorage::new())
    }

    /// Store token and user together. The record is persisted first, so a
    /// storage failure leaves the previous session untouched.
    pub fn set_session(&self, token: impl Into<String>, user: User) -> Result<Session, SessionError> {
        let token = token.into();
        check_identity(&token, &user)?;

        let session = Session {
            token,
            user,
            established_at: Utc::now(),
        };

        let _writer = self.inner.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.storage.save(&session)?;
        *self.write_current() = Some(session.clone());

        tracing::info!("Session established for user {}", session.user.id);
        let _ = self.inner.events.send(SessionEvent::Established {
            user_id: session.user.id.clone(),
        });

        Ok(session)
    }

    /// Current session, if any
    pub fn get_session(&self) -> Option<Session> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove token and user. Idempotent: returns false and publishes nothing
    /// when there was no session.
    pub fn clear(&self, reason: ClearReason) -> bool {
        let _writer = self.inner.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // The in-memory session ends even if the record cannot be removed.
        if let Err(e) = self.inner.storage.remove() {
            tracing::error!("Failed to remove persisted session: {}", e);
        }
        let previous = self.write_current().take();

        match previous {
            Some(session) => {
                match reason {
                    ClearReason::Logout => {
                        tracing::info!("Session cleared for user {} (logout)", session.user.id)
                    }
                    _ => tracing::warn!(
                        "Session cleared for user {} ({:?})",
                        session.user.id,
                        reason
                    ),
                }
                let _ = self.inner.events.send(SessionEvent::Cleared { reason });
                true
            }
            None => false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Bearer token of the current session
    pub fn token(&self) -> Option<String> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.token.clone())
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn write_current(&self) -> std::sync::RwLockWriteGuard<'_, Option<Session>> {
        self.inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
