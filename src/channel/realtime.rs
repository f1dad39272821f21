//! RealtimeChannel - connection state machine, retry timer and fan-out
//!
//! The channel owns at most one transport at a time. A background driver task
//! opens it, pumps frames, and on failure waits a fixed delay before trying
//! again. The driver is stopped through a oneshot; every state change it makes
//! is checked against an epoch so a driver that was replaced can never touch
//! the state of its successor.

use super::{ChannelError, ChannelState, ChannelStatus, Connector, Transport, WsConnector};
use crate::config::Config;
use crate::protocol::{encode_outbound, parse_inbound, ClientMessage, InboundMessage};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant, Interval};
use url::Url;

/// Callback receiving every successfully parsed inbound message
pub type Listener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Default fixed delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Floor for the reconnect delay; shorter values would spin on a dead endpoint
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

struct Control {
    state: ChannelState,
    epoch: u64,
    stop: Option<oneshot::Sender<()>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    endpoint: String,
    reconnect_delay: Duration,
    heartbeat: Option<Duration>,
    control: Mutex<Control>,
    subscribers: Mutex<Vec<(u64, Listener)>>,
    next_subscriber: AtomicU64,
    transitions: broadcast::Sender<ChannelStatus>,
}

/// Handle to the realtime channel. Dropping it disconnects.
pub struct RealtimeChannel {
    shared: Arc<Shared>,
}

/// Registration of one listener; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl RealtimeChannel {
    /// Create a disconnected channel. `endpoint` is the transport origin; the
    /// user id is appended as the last path segment on connect.
    pub fn new(endpoint: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                connector,
                endpoint: endpoint.into(),
                reconnect_delay: DEFAULT_RECONNECT_DELAY,
                heartbeat: None,
                control: Mutex::new(Control {
                    state: ChannelState::default(),
                    epoch: 0,
                    stop: None,
                    outbound: None,
                }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                transitions,
            }),
        }
    }

    /// WebSocket channel configured from `[endpoints]` and `[realtime]`
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoints.ws_url.clone(), Arc::new(WsConnector))
            .with_reconnect_delay(config.realtime.reconnect_delay())
            .with_heartbeat(config.realtime.heartbeat())
    }

    /// Fixed delay between attempts, never below [`MIN_RECONNECT_DELAY`]
    pub fn with_reconnect_delay(self, delay: Duration) -> Self {
        if delay < MIN_RECONNECT_DELAY {
            tracing::warn!(
                "Reconnect delay {:?} raised to {:?}",
                delay,
                MIN_RECONNECT_DELAY
            );
        }
        self.rebuild(|shared| shared.reconnect_delay = delay.max(MIN_RECONNECT_DELAY))
    }

    /// Send a `ping` frame at this period while connected
    pub fn with_heartbeat(self, period: Option<Duration>) -> Self {
        self.rebuild(|shared| shared.heartbeat = period)
    }

    fn rebuild(mut self, apply: impl FnOnce(&mut Shared)) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => apply(shared),
            None => tracing::warn!("Channel options ignored: channel is already in use"),
        }
        self
    }

    /// Open the channel for `user_id`. A no-op while already connecting or
    /// connected for the same user; a pending retry is replaced by an
    /// immediate attempt.
    pub fn connect(&self, user_id: &str) -> Result<(), ChannelError> {
        self.shared.connect(user_id)
    }

    /// Close the transport, cancel any pending retry and drop all subscribers
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Register a listener for inbound messages
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers()
            .push((id, Arc::new(listener) as Listener));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Queue a message for the server. Only valid while connected.
    pub fn send(&self, message: &ClientMessage) -> Result<(), ChannelError> {
        let control = self.shared.control();
        let status = control.state.status;
        let outbound = match (&control.outbound, status) {
            (Some(outbound), ChannelStatus::Connected) => outbound,
            _ => {
                tracing::warn!("Dropping '{}' message: channel is {}", message.kind, status);
                return Err(ChannelError::NotConnected { status });
            }
        };
        let frame = encode_outbound(message)?;
        outbound
            .send(frame)
            .map_err(|_| ChannelError::NotConnected { status })
    }

    pub fn state(&self) -> ChannelState {
        self.shared.control().state.clone()
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared.control().state.status
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.control().state.retry_count
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers().len()
    }

    /// Stream of every status the channel enters, in order
    pub fn transitions(&self) -> broadcast::Receiver<ChannelStatus> {
        self.shared.transitions.subscribe()
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving messages. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_subscriber(self.id);
        }
    }
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, control: &mut Control, next: ChannelStatus) {
        let current = control.state.status;
        debug_assert!(
            current.can_transition_to(next),
            "invalid channel transition {} -> {}",
            current,
            next
        );
        if !current.can_transition_to(next) {
            tracing::error!("Ignoring invalid channel transition {} -> {}", current, next);
            return;
        }
        tracing::debug!("Realtime channel {} -> {}", current, next);
        control.state.status = next;
        let _ = self.transitions.send(next);
    }

    fn stop_driver(&self, control: &mut Control) {
        if let Some(stop) = control.stop.take() {
            let _ = stop.send(());
        }
        control.outbound = None;
        control.epoch += 1;
    }

    fn connect(self: &Arc<Self>, user_id: &str) -> Result<(), ChannelError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(ChannelError::MissingUserId);
        }
        let url = endpoint_for(&self.endpoint, user_id)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        let mut control = self.control();
        let same_user = control.state.user_id.as_deref() == Some(user_id);
        match control.state.status {
            ChannelStatus::Connecting | ChannelStatus::Connected if same_user => return Ok(()),
            ChannelStatus::Disconnected => {}
            ChannelStatus::Reconnecting if same_user => self.stop_driver(&mut control),
            _ => {
                tracing::info!("Realtime channel switching to user {}", user_id);
                self.stop_driver(&mut control);
                self.transition(&mut control, ChannelStatus::Disconnected);
                control.state.retry_count = 0;
            }
        }

        control.state.user_id = Some(user_id.to_string());
        self.transition(&mut control, ChannelStatus::Connecting);

        let (stop_tx, stop_rx) = oneshot::channel();
        control.epoch += 1;
        control.stop = Some(stop_tx);
        let epoch = control.epoch;
        drop(control);

        runtime.spawn(drive(Arc::clone(self), epoch, url, stop_rx));
        Ok(())
    }

    fn disconnect(&self) {
        let mut control = self.control();
        self.stop_driver(&mut control);
        if control.state.status != ChannelStatus::Disconnected {
            self.transition(&mut control, ChannelStatus::Disconnected);
            tracing::info!("Realtime channel disconnected");
        }
        control.state = ChannelState::default();
        drop(control);

        // Listeners are dropped outside the lock; they may own subscriptions.
        let listeners = std::mem::take(&mut *self.subscribers());
        drop(listeners);
    }

    fn remove_subscriber(&self, id: u64) {
        let now_empty = {
            let mut subscribers = self.subscribers();
            let before = subscribers.len();
            subscribers.retain(|(sid, _)| *sid != id);
            before != subscribers.len() && subscribers.is_empty()
        };
        if now_empty && self.control().state.status != ChannelStatus::Disconnected {
            tracing::debug!("Last subscriber left; closing realtime channel");
            self.disconnect();
        }
    }

    fn mark_connected(&self, epoch: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut control = self.control();
        if control.epoch != epoch {
            return false;
        }
        self.transition(&mut control, ChannelStatus::Connected);
        control.state.retry_count = 0;
        control.outbound = Some(outbound);
        tracing::info!(
            "Realtime channel connected for user {}",
            control.state.user_id.as_deref().unwrap_or("?")
        );
        true
    }

    fn mark_reconnecting(&self, epoch: u64) -> Option<u32> {
        let mut control = self.control();
        if control.epoch != epoch {
            return None;
        }
        control.outbound = None;
        self.transition(&mut control, ChannelStatus::Reconnecting);
        control.state.retry_count = control.state.retry_count.saturating_add(1);
        Some(control.state.retry_count)
    }

    fn mark_connecting(&self, epoch: u64) -> bool {
        let mut control = self.control();
        if control.epoch != epoch {
            return false;
        }
        self.transition(&mut control, ChannelStatus::Connecting);
        true
    }

    /// Parse one frame and hand it to every listener in registration order
    fn deliver(&self, text: &str) {
        let message = match parse_inbound(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Discarding malformed realtime payload: {}", e);
                return;
            }
        };

        let listeners: Vec<Listener> = self
            .subscribers()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&message))).is_err() {
                tracing::error!(
                    "Realtime subscriber panicked on '{}' message; continuing delivery",
                    message.kind
                );
            }
        }
    }
}

enum PumpExit {
    Stopped,
    Lost(String),
}

/// Driver task: connect, pump, and retry after a fixed delay until stopped
async fn drive(
    shared: Arc<Shared>,
    epoch: u64,
    url: String,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let attempt = tokio::select! {
            _ = &mut stop => return,
            attempt = shared.connector.connect(&url) => attempt,
        };

        match attempt {
            Ok(mut transport) => {
                let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
                if !shared.mark_connected(epoch, outbound_tx) {
                    transport.close().await;
                    return;
                }
                match pump(&shared, transport.as_mut(), &mut outbound_rx, &mut stop).await {
                    PumpExit::Stopped => {
                        transport.close().await;
                        return;
                    }
                    PumpExit::Lost(reason) => {
                        tracing::warn!("Realtime connection lost: {}", reason)
                    }
                }
            }
            Err(e) => tracing::warn!("Realtime connection to {} failed: {}", url, e),
        }

        let Some(retry_count) = shared.mark_reconnecting(epoch) else {
            return;
        };
        tracing::warn!(
            retry_count,
            "Retrying realtime connection in {:?}",
            shared.reconnect_delay
        );

        tokio::select! {
            _ = &mut stop => return,
            _ = sleep(shared.reconnect_delay) => {}
        }
        if !shared.mark_connecting(epoch) {
            return;
        }
    }
}

async fn pump(
    shared: &Shared,
    transport: &mut dyn Transport,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    stop: &mut oneshot::Receiver<()>,
) -> PumpExit {
    let mut heartbeat = shared
        .heartbeat
        .map(|period| interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            _ = &mut *stop => return PumpExit::Stopped,

            frame = transport.recv() => match frame {
                Some(Ok(text)) => shared.deliver(&text),
                Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                None => return PumpExit::Lost("closed by peer".to_string()),
            },

            Some(frame) = outbound.recv() => {
                if let Err(e) = transport.send(frame).await {
                    return PumpExit::Lost(e.to_string());
                }
            }

            _ = next_tick(&mut heartbeat) => {
                match encode_outbound(&ClientMessage::ping()) {
                    Ok(ping) => {
                        if let Err(e) = transport.send(ping).await {
                            return PumpExit::Lost(e.to_string());
                        }
                    }
                    Err(e) => tracing::error!("Failed to encode heartbeat: {}", e),
                }
            }
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Transport address for a user: the origin with the user id appended
fn endpoint_for(base: &str, user_id: &str) -> Result<String, ChannelError> {
    let invalid = |reason: String| ChannelError::InvalidUrl {
        url: base.to_string(),
        reason,
    };
    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("URL cannot carry a path".to_string()))?
        .pop_if_empty()
        .push(user_id);
    Ok(url.to_string())
}
