//! SyncClient - one handle composing session, REST, realtime and dashboards
//!
//! A view is mounted through [`SyncClient::mount`]: the route guard runs
//! first, then the realtime channel is opened for the current user while the
//! dashboard reads and the notification seed run concurrently. Pushed
//! notifications land in the same feed the REST seed filled. When the session
//! ends for any reason, every mounted view is torn down, the channel closes
//! and the feed is evicted.

use crate::api::{ApiClient, ApiError, AuthService, Credentials, Registration};
use crate::channel::{ChannelError, RealtimeChannel, Subscription};
use crate::config::Config;
use crate::dashboard::{DashboardAggregator, DashboardSnapshot, DashboardView, ViewScope};
use crate::guard::{decide, Decision, Route, RouteGuard};
use crate::notifications::{Notification, NotificationFeed};
use crate::protocol::{InboundMessage, ServerEvent};
use crate::session::{ClearReason, FileStorage, Session, SessionEvent, SessionStore, User};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Something a mounted view should react to
#[derive(Debug, Clone)]
pub enum ViewEvent {
    /// A realtime message, already applied to the notification feed
    Realtime(ServerEvent),
    /// A periodic refresh replaced the view's snapshot
    Refreshed(DashboardSnapshot),
}

/// Result of a mount attempt
#[derive(Debug)]
pub enum Mount {
    Mounted(MountedView),
    Redirect(Route),
}

type SharedFeed = Arc<Mutex<NotificationFeed>>;

/// Mounted view scopes, each tagged with the user it was mounted for
type Scopes = Arc<Mutex<Vec<(String, ViewScope)>>>;

fn lock(feed: &Mutex<NotificationFeed>) -> MutexGuard<'_, NotificationFeed> {
    feed.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A dashboard on screen. Dropping it unmounts: late results are discarded,
/// the refresh stops, and the realtime listener is removed.
pub struct MountedView {
    view: DashboardView,
    snapshot: DashboardSnapshot,
    scope: ViewScope,
    events: mpsc::UnboundedReceiver<ViewEvent>,
    feed: SharedFeed,
    refresh: Option<JoinHandle<()>>,
    _subscription: Subscription,
}

impl std::fmt::Debug for MountedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedView")
            .field("view", &self.view)
            .field("keys", &self.snapshot.len())
            .field("mounted", &self.scope.is_mounted())
            .finish()
    }
}

impl MountedView {
    pub fn view(&self) -> DashboardView {
        self.view
    }

    pub fn snapshot(&self) -> &DashboardSnapshot {
        &self.snapshot
    }

    pub fn is_mounted(&self) -> bool {
        self.scope.is_mounted()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.feed).items().to_vec()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.feed).unread_count()
    }

    /// Next event for this view. `None` once the view was torn down, e.g.
    /// because the session ended; navigate again to find out where to go.
    pub async fn next_event(&mut self) -> Option<ViewEvent> {
        if !self.scope.is_mounted() {
            return None;
        }
        let event = tokio::select! {
            event = self.events.recv() => event?,
            _ = self.scope.unmounted() => return None,
        };
        if let ViewEvent::Refreshed(snapshot) = &event {
            self.snapshot = snapshot.clone();
        }
        Some(event)
    }

    pub fn unmount(self) {}
}

impl Drop for MountedView {
    fn drop(&mut self) {
        self.scope.unmount();
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        tracing::debug!("Unmounted {} dashboard", self.view.name());
    }
}

/// Client-side synchronization layer for the threat-intelligence platform
pub struct SyncClient {
    config: Config,
    session: SessionStore,
    api: ApiClient,
    auth: AuthService,
    guard: RouteGuard,
    aggregator: DashboardAggregator,
    channel: Arc<RealtimeChannel>,
    feed: SharedFeed,
    scopes: Scopes,
    watcher: JoinHandle<()>,
}

impl SyncClient {
    /// Client with the persisted session and a WebSocket channel.
    /// Must be called within a Tokio runtime.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let session = SessionStore::open(FileStorage::new(config.session_path()));
        let channel = RealtimeChannel::from_config(&config);
        Self::with_parts(config, session, channel)
    }

    /// Client over explicit parts
    pub fn with_parts(
        config: Config,
        session: SessionStore,
        channel: RealtimeChannel,
    ) -> Result<Self, ClientError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;
        let api = ApiClient::new(&config.endpoints.api_url, session.clone())?;
        let aggregator = DashboardAggregator::new(Arc::new(api.clone()))
            .with_read_timeout(config.dashboard.request_timeout());
        let channel = Arc::new(channel);
        let feed: SharedFeed = Arc::default();
        let scopes: Scopes = Arc::default();

        let watcher = runtime.spawn(watch_session(
            session.clone(),
            session.subscribe(),
            Arc::clone(&channel),
            Arc::clone(&feed),
            Arc::clone(&scopes),
        ));

        Ok(Self {
            auth: AuthService::new(api.clone()),
            guard: RouteGuard::new(session.clone()),
            config,
            session,
            api,
            aggregator,
            channel,
            feed,
            scopes,
            watcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn aggregator(&self) -> &DashboardAggregator {
        &self.aggregator
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ClientError> {
        let credentials = Credentials {
            email: email.to_string(),
            password: password.to_string(),
        };
        Ok(self.auth.login(&credentials).await?)
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<Session, ClientError> {
        let registration = Registration {
            email: email.to_string(),
            password: password.to_string(),
            full_name: full_name.to_string(),
        };
        Ok(self.auth.register(&registration).await?)
    }

    /// Validate a restored session with the server; `None` if there is none
    /// or the server no longer accepts it
    pub async fn restore(&self) -> Result<Option<User>, ClientError> {
        Ok(self.auth.validate().await?)
    }

    /// Idempotent. Mounted views are torn down by the session watcher.
    pub fn logout(&self) {
        self.auth.logout();
    }

    /// Route guard decision for a navigation attempt
    pub fn navigate(&self, route: Route) -> Decision {
        self.guard.check(route)
    }

    /// Mount a dashboard: guard, open the channel, then aggregate and seed
    /// the notification feed concurrently
    pub async fn mount(&self, view: DashboardView) -> Result<Mount, ClientError> {
        let route = view.route();
        let session = self.session.get_session();
        let decision = decide(session.as_ref(), route.required_role());
        let session = match (decision, session) {
            (Decision::Render, Some(session)) => session,
            (decision, _) => {
                let target = decision.redirect_target().unwrap_or(Route::Login);
                tracing::debug!("Mount of {} redirected to {}", view.name(), target);
                return Ok(Mount::Redirect(target));
            }
        };
        let user_id = session.user().id.clone();
        if lock(&self.feed).claim(&user_id) {
            tracing::info!("Evicted notifications of the previous user");
        }

        let scope = ViewScope::new();
        {
            let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
            scopes.retain(|(_, scope)| scope.is_mounted());
            scopes.push((user_id.clone(), scope.clone()));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let listener_feed = Arc::clone(&self.feed);
        let listener_tx = events_tx.clone();
        let listener_user = user_id.clone();
        let subscription = self.channel.subscribe(move |message: &InboundMessage| {
            let event = message.event();
            {
                let mut feed = lock(&listener_feed);
                if feed.owner() == Some(listener_user.as_str()) {
                    feed.apply_event(&event);
                }
            }
            let _ = listener_tx.send(ViewEvent::Realtime(event));
        });
        if let Err(e) = self.channel.connect(&user_id) {
            scope.unmount();
            return Err(e.into());
        }

        let descriptors = view.descriptors();
        let (snapshot, seeded) = tokio::join!(
            self.aggregator.aggregate_in(&scope, &descriptors),
            self.refresh_notifications(),
        );
        if let Err(e) = seeded {
            tracing::warn!("Notification feed not seeded: {}", e);
        }

        // The session may have ended or changed hands while the reads were in flight
        let current = self.session.get_session();
        let redirect = match decide(current.as_ref(), route.required_role()) {
            Decision::Render if current.as_ref().is_some_and(|s| s.user().id != user_id) => {
                Some(route)
            }
            decision => decision.redirect_target(),
        };
        let snapshot = match (snapshot, redirect) {
            (Some(snapshot), None) => snapshot,
            (_, target) => {
                scope.unmount();
                return Ok(Mount::Redirect(target.unwrap_or(Route::Login)));
            }
        };

        let refresh = view.is_live().then(|| {
            let tx = events_tx.clone();
            self.aggregator.spawn_refresh(
                scope.clone(),
                descriptors,
                self.config.dashboard.refresh_interval(),
                move |snapshot| {
                    let _ = tx.send(ViewEvent::Refreshed(snapshot));
                },
            )
        });
        drop(events_tx);

        tracing::info!(
            "Mounted {} dashboard for {} ({} of {} reads ok)",
            view.name(),
            user_id,
            snapshot.len() - snapshot.failed_keys().len(),
            snapshot.len()
        );

        Ok(Mount::Mounted(MountedView {
            view,
            snapshot,
            scope,
            events,
            feed: Arc::clone(&self.feed),
            refresh,
            _subscription: subscription,
        }))
    }

    /// Re-seed the notification feed from REST. A result that arrives after
    /// the session changed is dropped.
    pub async fn refresh_notifications(&self) -> Result<(), ClientError> {
        let owner = self.session.get_session().map(|s| s.user().id.clone());
        let fetched = self
            .api
            .fetch_notifications(self.config.dashboard.notification_limit)
            .await?;
        let current = self.session.get_session().map(|s| s.user().id.clone());
        let Some(owner) = owner.filter(|owner| current.as_ref() == Some(owner)) else {
            tracing::debug!("Session changed during notification fetch; dropping result");
            return Ok(());
        };
        let mut feed = lock(&self.feed);
        feed.claim(&owner);
        feed.seed(fetched);
        Ok(())
    }

    /// Mark a notification read. Returns whether anything changed; a
    /// notification already read locally issues no request.
    pub async fn mark_read(&self, id: &str) -> Result<bool, ClientError> {
        if lock(&self.feed).is_read(id) {
            tracing::debug!("Notification {} already read", id);
            return Ok(false);
        }
        self.api.mark_notification_read(id).await?;
        Ok(lock(&self.feed).mark_read(id))
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.feed).items().to_vec()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.feed).unread_count()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.watcher.abort();
        self.channel.disconnect();
    }
}

/// Tear everything session-bound down whenever the session ends
async fn watch_session(
    session: SessionStore,
    mut events: broadcast::Receiver<SessionEvent>,
    channel: Arc<RealtimeChannel>,
    feed: SharedFeed,
    scopes: Scopes,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Cleared { reason }) => {
                teardown(&channel, &feed, &scopes, reason);
            }
            Ok(SessionEvent::Established { user_id }) => {
                release_other_users(&channel, &feed, &scopes, &user_id);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Session watcher skipped {} events", skipped);
                match session.get_session() {
                    Some(current) => {
                        release_other_users(&channel, &feed, &scopes, &current.user().id)
                    }
                    None => teardown(&channel, &feed, &scopes, ClearReason::Unauthorized),
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn teardown(
    channel: &RealtimeChannel,
    feed: &Mutex<NotificationFeed>,
    scopes: &Mutex<Vec<(String, ViewScope)>>,
    reason: ClearReason,
) {
    let mounted = std::mem::take(&mut *scopes.lock().unwrap_or_else(PoisonError::into_inner));
    for (_, scope) in &mounted {
        scope.unmount();
    }
    channel.disconnect();
    lock(feed).clear();
    tracing::info!(
        "Session ended ({:?}); closed {} views and the realtime channel",
        reason,
        mounted.len()
    );
}

/// A session for `user_id` replaced whatever was there. Views, channel and
/// feed still held for a previous user are released; those of `user_id` stay.
fn release_other_users(
    channel: &RealtimeChannel,
    feed: &Mutex<NotificationFeed>,
    scopes: &Mutex<Vec<(String, ViewScope)>>,
    user_id: &str,
) {
    let stale: Vec<ViewScope> = {
        let mut scopes = scopes.lock().unwrap_or_else(PoisonError::into_inner);
        let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *scopes)
            .into_iter()
            .partition(|(owner, _)| owner != user_id);
        *scopes = kept;
        stale.into_iter().map(|(_, scope)| scope).collect()
    };
    for scope in &stale {
        scope.unmount();
    }

    let channel_released = channel
        .state()
        .user_id
        .is_some_and(|owner| owner != user_id);
    if channel_released {
        channel.disconnect();
    }
    let evicted = {
        let mut feed = lock(feed);
        match feed.owner() {
            Some(owner) if owner != user_id => feed.claim(user_id),
            _ => false,
        }
    };

    if stale.is_empty() && !channel_released && !evicted {
        tracing::debug!("Session established for {}", user_id);
    } else {
        tracing::info!(
            "Session switched to {}; closed {} views of the previous user",
            user_id,
            stale.len()
        );
    }
}
