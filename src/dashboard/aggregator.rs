//! DashboardAggregator - issue reads concurrently, settle each independently

use super::{DashboardSnapshot, FetchDescriptor, MetricEntry, MetricSource};
use crate::api::ApiError;
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

/// Lifetime of the view that asked for data. Results that settle after the
/// view unmounts are dropped instead of delivered.
#[derive(Debug, Clone)]
pub struct ViewScope {
    mounted: Arc<watch::Sender<bool>>,
}

impl Default for ViewScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewScope {
    pub fn new() -> Self {
        let (mounted, _) = watch::channel(true);
        Self {
            mounted: Arc::new(mounted),
        }
    }

    pub fn is_mounted(&self) -> bool {
        *self.mounted.borrow()
    }

    /// Idempotent
    pub fn unmount(&self) {
        self.mounted.send_replace(false);
    }

    /// Resolves once the view has unmounted
    pub async fn unmounted(&self) {
        let mut mounted = self.mounted.subscribe();
        let _ = mounted.wait_for(|m| !*m).await;
    }
}

/// Runs a set of reads in parallel and merges them into one snapshot
#[derive(Clone)]
pub struct DashboardAggregator {
    source: Arc<dyn MetricSource>,
    read_timeout: Option<Duration>,
}

impl DashboardAggregator {
    pub fn new(source: Arc<dyn MetricSource>) -> Self {
        Self {
            source,
            read_timeout: None,
        }
    }

    /// Bound each individual read; a read that exceeds it settles as failed
    pub fn with_read_timeout(mut self, limit: Duration) -> Self {
        self.read_timeout = Some(limit);
        self
    }

    /// Issue every read at once and wait for all of them to settle. Never
    /// fails: each key carries its own status, even when all of them failed.
    /// Duplicate keys keep the first descriptor.
    pub async fn aggregate(&self, descriptors: &[FetchDescriptor]) -> DashboardSnapshot {
        let mut seen = HashSet::new();
        let unique: Vec<&FetchDescriptor> = descriptors
            .iter()
            .filter(|d| {
                let first = seen.insert(d.key.as_str());
                if !first {
                    tracing::warn!("Ignoring duplicate dashboard key '{}'", d.key);
                }
                first
            })
            .collect();

        let results = join_all(unique.iter().map(|d| self.read(d))).await;

        let entries: BTreeMap<String, MetricEntry> = unique
            .iter()
            .map(|d| d.key.clone())
            .zip(results)
            .collect();

        let snapshot = DashboardSnapshot::new(entries);
        let failed = snapshot.failed_keys().len();
        if failed > 0 {
            tracing::warn!(
                "Dashboard aggregation settled with {}/{} failed reads",
                failed,
                snapshot.len()
            );
        } else {
            tracing::debug!("Dashboard aggregation settled: {} reads", snapshot.len());
        }
        snapshot
    }

    /// Aggregate on behalf of a view; `None` if the view unmounted first
    pub async fn aggregate_in(
        &self,
        scope: &ViewScope,
        descriptors: &[FetchDescriptor],
    ) -> Option<DashboardSnapshot> {
        if !scope.is_mounted() {
            return None;
        }
        tokio::select! {
            snapshot = self.aggregate(descriptors) => {
                if scope.is_mounted() {
                    Some(snapshot)
                } else {
                    tracing::debug!("View unmounted; discarding dashboard snapshot");
                    None
                }
            }
            _ = scope.unmounted() => {
                tracing::debug!("View unmounted; abandoning dashboard aggregation");
                None
            }
        }
    }

    /// Re-aggregate every `every` until the scope unmounts. The first run
    /// happens one period in, since the caller already holds a snapshot;
    /// each snapshot replaces the previous one wholesale.
    pub fn spawn_refresh<F>(
        &self,
        scope: ViewScope,
        descriptors: Vec<FetchDescriptor>,
        every: Duration,
        mut on_snapshot: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(DashboardSnapshot) + Send + 'static,
    {
        let aggregator = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scope.unmounted() => break,
                }
                match aggregator.aggregate_in(&scope, &descriptors).await {
                    Some(snapshot) => on_snapshot(snapshot),
                    None => break,
                }
            }
            tracing::debug!("Dashboard refresh stopped");
        })
    }

    async fn read(&self, descriptor: &FetchDescriptor) -> MetricEntry {
        let fetch = self.source.fetch(&descriptor.path);
        let result = match self.read_timeout {
            Some(limit) => timeout(limit, fetch)
                .await
                .unwrap_or_else(|_| Err(ApiError::Timeout(limit))),
            None => fetch.await,
        };
        match result {
            Ok(value) => MetricEntry::ok(value),
            Err(e) => {
                tracing::warn!(
                    "Dashboard read '{}' ({}) failed: {}",
                    descriptor.key,
                    descriptor.path,
                    e
                );
                MetricEntry::failed(e.to_string())
            }
        }
    }
}
