//! Shared fixtures: an in-process connector whose server side the test drives

#![allow(dead_code)]

pub mod mock_api;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threatlink::channel::{ChannelStatus, Connector, Transport, TransportError};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

/// Server end of one accepted connection. Dropping it closes the connection.
pub struct Peer {
    pub url: String,
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    /// Push one text frame to the client
    pub fn push(&self, frame: &str) {
        let _ = self.to_client.send(Ok(frame.to_string()));
    }

    /// Break the connection with a transport error
    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .send(Err(TransportError::Lost(reason.to_string())));
    }

    /// Next frame the client sent
    pub async fn next_sent(&mut self) -> Option<String> {
        timeout(Duration::from_secs(60), self.from_client.recv())
            .await
            .ok()
            .flatten()
    }
}

struct FakeTransport {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Lost("peer gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Connector that refuses a scripted number of attempts, then accepts
pub struct FakeConnector {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    peers: mpsc::UnboundedSender<Peer>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            failures_left: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            peers,
        });
        (connector, rx)
    }

    /// Refuse the next `n` attempts
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(TransportError::Refused("scripted failure".to_string()));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.peers.send(Peer {
            url: url.to_string(),
            to_client,
            from_client,
        });
        Ok(Box::new(FakeTransport { inbound, outbound }))
    }
}

/// Collect transitions until `target` is entered (inclusive)
pub async fn wait_for(
    transitions: &mut broadcast::Receiver<ChannelStatus>,
    target: ChannelStatus,
) -> Vec<ChannelStatus> {
    let mut seen = Vec::new();
    loop {
        let status = timeout(Duration::from_secs(600), transitions.recv())
            .await
            .expect("timed out waiting for channel status")
            .expect("transition stream closed");
        seen.push(status);
        if status == target {
            return seen;
        }
    }
}

/// Receive the next accepted connection
pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    timeout(Duration::from_secs(600), peers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}
