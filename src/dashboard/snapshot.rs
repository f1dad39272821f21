//! Immutable result of one aggregation

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of one read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricStatus {
    Ok,
    Failed,
}

/// One key of a snapshot: its status plus either a value or a failure reason
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEntry {
    pub status: MetricStatus,
    pub value: Option<Value>,
    pub error: Option<String>,
}

impl MetricEntry {
    pub fn ok(value: Value) -> Self {
        Self {
            status: MetricStatus::Ok,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: MetricStatus::Failed,
            value: None,
            error: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == MetricStatus::Ok
    }
}

/// Every requested key with its own status, presented all at once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    entries: BTreeMap<String, MetricEntry>,
    fetched_at: DateTime<Utc>,
}

impl DashboardSnapshot {
    pub(crate) fn new(entries: BTreeMap<String, MetricEntry>) -> Self {
        Self {
            entries,
            fetched_at: Utc::now(),
        }
    }

    pub fn entry(&self, key: &str) -> Option<&MetricEntry> {
        self.entries.get(key)
    }

    pub fn status(&self, key: &str) -> Option<MetricStatus> {
        self.entries.get(key).map(|e| e.status)
    }

    /// Value of a key that was read successfully
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// Decode a successful value into a typed payload. A payload that does not
    /// match `T` yields `None`, same as a failed read.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.value(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!("Metric '{}' has an unexpected shape: {}", key, e);
                None
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &MetricEntry)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), e))
    }

    pub fn failed_keys(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_ok())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Every key read successfully
    pub fn is_complete(&self) -> bool {
        self.entries.values().all(MetricEntry::is_ok)
    }

    /// Every key failed (an empty snapshot counts as neither)
    pub fn all_failed(&self) -> bool {
        !self.entries.is_empty() && self.entries.values().all(|e| !e.is_ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Older than `max_age`; a stale snapshot must not be shown as fresh
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        chrono::Duration::from_std(max_age).map_or(false, |max| age > max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> DashboardSnapshot {
        let mut entries = BTreeMap::new();
        entries.insert("stats".to_string(), MetricEntry::ok(json!({"total_threats": 4})));
        entries.insert("timeline".to_string(), MetricEntry::failed("boom"));
        DashboardSnapshot::new(entries)
    }

    #[test]
    fn test_per_key_status() {
        let snap = snapshot();
        assert_eq!(snap.status("stats"), Some(MetricStatus::Ok));
        assert_eq!(snap.status("timeline"), Some(MetricStatus::Failed));
        assert_eq!(snap.status("missing"), None);
        assert!(snap.value("timeline").is_none());
        assert_eq!(snap.entry("timeline").unwrap().error.as_deref(), Some("boom"));
        assert_eq!(snap.failed_keys(), vec!["timeline"]);
        assert!(!snap.is_complete());
        assert!(!snap.all_failed());
    }

    #[test]
    fn test_decode_typed() {
        #[derive(serde::Deserialize)]
        struct Stats {
            total_threats: u64,
        }
        let snap = snapshot();
        assert_eq!(snap.decode::<Stats>("stats").unwrap().total_threats, 4);
        assert!(snap.decode::<Stats>("timeline").is_none());
        assert!(snap.decode::<Vec<u8>>("stats").is_none());
    }

    #[test]
    fn test_freshness() {
        let snap = snapshot();
        assert!(!snap.is_stale(Duration::from_secs(60)));

        let old = DashboardSnapshot {
            fetched_at: Utc::now() - chrono::Duration::minutes(5),
            ..snap
        };
        assert!(old.is_stale(Duration::from_secs(60)));
    }
}
