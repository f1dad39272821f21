//! Notification feed - REST seed plus realtime deltas

use crate::protocol::ServerEvent;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A user-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique within the session
    #[serde(alias = "_id")]
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub message: String,

    /// info, warning, alert, threat_alert
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,

    #[serde(default)]
    pub severity: Option<String>,

    /// Only ever flips from false to true
    #[serde(default)]
    pub read: bool,

    #[serde(
        alias = "created_at",
        default = "Utc::now",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub link: Option<String>,
}

fn default_kind() -> String {
    "info".to_string()
}

/// Accepts RFC 3339 and offset-less ISO timestamps (treated as UTC)
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// The notifications list endpoint answers either a bare list or a wrapper
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NotificationList {
    Wrapped { notifications: Vec<Notification> },
    Bare(Vec<Notification>),
}

impl NotificationList {
    pub fn into_vec(self) -> Vec<Notification> {
        match self {
            NotificationList::Wrapped { notifications } => notifications,
            NotificationList::Bare(list) => list,
        }
    }
}

/// Notifications held by a view, newest first. The feed belongs to one user
/// at a time; handing it to another user evicts everything first.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    items: Vec<Notification>,
    owner: Option<String>,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the feed to `user_id`. Returns true when items of a previous
    /// owner were evicted.
    pub fn claim(&mut self, user_id: &str) -> bool {
        if self.owner.as_deref() == Some(user_id) {
            return false;
        }
        let evicted = !self.items.is_empty();
        self.items.clear();
        self.owner = Some(user_id.to_string());
        evicted
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Replace the feed with a freshly fetched list. Duplicate ids keep the
    /// first occurrence and a locally read notification stays read. Pushed
    /// notifications the fetch does not know about yet stay on top.
    pub fn seed(&mut self, fetched: Vec<Notification>) {
        let mut seeded: Vec<Notification> = Vec::with_capacity(fetched.len());
        for mut notification in fetched {
            if seeded.iter().any(|n| n.id == notification.id) {
                continue;
            }
            if self.is_read(&notification.id) {
                notification.read = true;
            }
            seeded.push(notification);
        }
        let pushed: Vec<Notification> = self
            .items
            .drain(..)
            .filter(|held| !seeded.iter().any(|n| n.id == held.id))
            .collect();
        self.items = pushed.into_iter().chain(seeded).collect();
    }

    /// Add a pushed notification. Returns false when the id is already held;
    /// in that case only the read flag can advance.
    pub fn push(&mut self, notification: Notification) -> bool {
        if let Some(existing) = self.items.iter_mut().find(|n| n.id == notification.id) {
            existing.read |= notification.read;
            return false;
        }
        self.items.insert(0, notification);
        true
    }

    /// Apply a realtime event; only `notification` events touch the feed
    pub fn apply_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Notification(notification) => self.push(notification.clone()),
            _ => false,
        }
    }

    /// Mark a held notification read. Returns true only if the flag changed.
    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(n) if !n.read => {
                n.read = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_read(&self, id: &str) -> bool {
        self.get(id).is_some_and(|n| n.read)
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Evict everything and release ownership (logout)
    pub fn clear(&mut self) {
        self.items.clear();
        self.owner = None;
    }
}
