//! Dashboard aggregation - independent REST reads merged into one snapshot

mod aggregator;
mod snapshot;

pub use aggregator::{DashboardAggregator, ViewScope};
pub use snapshot::{DashboardSnapshot, MetricEntry, MetricStatus};

use crate::api::ApiError;
use crate::guard::Route;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One read of an aggregation: the snapshot key and the path to GET
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchDescriptor {
    pub key: String,
    pub path: String,
}

impl FetchDescriptor {
    pub fn new(key: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
        }
    }
}

/// Anything that can answer a dashboard read
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<Value, ApiError>;
}

/// The dashboards of the platform and the reads each one is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DashboardView {
    /// Personal dashboard: global counters, own submissions, recent threats
    User,
    /// Threat map, MITRE ATT&CK mapping and 30-day timeline
    Global,
    /// Moderation overview
    Admin,
}

impl DashboardView {
    pub fn descriptors(&self) -> Vec<FetchDescriptor> {
        match self {
            DashboardView::User => vec![
                FetchDescriptor::new("stats", "/dashboard/stats"),
                FetchDescriptor::new("user_stats", "/dashboard/user-stats"),
                FetchDescriptor::new("recent_threats", "/threats?limit=10"),
            ],
            DashboardView::Global => vec![
                FetchDescriptor::new("threat_map", "/dashboard/threat-map"),
                FetchDescriptor::new("mitre_mapping", "/dashboard/mitre-mapping"),
                FetchDescriptor::new("timeline", "/dashboard/timeline?days=30"),
            ],
            DashboardView::Admin => vec![
                FetchDescriptor::new("overview", "/admin/stats/overview"),
                FetchDescriptor::new("pending_threats", "/admin/threats/pending"),
                FetchDescriptor::new("users", "/admin/users"),
            ],
        }
    }

    /// Route the dashboard is rendered under
    pub fn route(&self) -> Route {
        match self {
            DashboardView::User => Route::Dashboard,
            DashboardView::Global => Route::GlobalDashboard,
            DashboardView::Admin => Route::Admin,
        }
    }

    /// Live views are re-read periodically while mounted
    pub fn is_live(&self) -> bool {
        matches!(self, DashboardView::Global)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DashboardView::User => "user",
            DashboardView::Global => "global",
            DashboardView::Admin => "admin",
        }
    }
}

impl std::str::FromStr for DashboardView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "me" => Ok(DashboardView::User),
            "global" => Ok(DashboardView::Global),
            "admin" => Ok(DashboardView::Admin),
            other => Err(format!("unknown dashboard '{}' (user, global, admin)", other)),
        }
    }
}

/// Payload of `/dashboard/stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardStats {
    pub total_threats: u64,
    pub recent_threats: u64,
    pub severity_distribution: BTreeMap<String, u64>,
    pub type_distribution: BTreeMap<String, u64>,
}

/// Payload of `/dashboard/user-stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserStats {
    pub total_submitted: u64,
}
