//! Cross-node fan-out over a shared publish/subscribe service.
//!
//! [`Bridge`] is what the hub talks to. It encodes [`Envelope`]s, applies the
//! origin rules that keep messages from looping between nodes, and forwards
//! decoded messages back into the hub. The transport underneath is any
//! [`Backplane`]: redis in production, [`memory::MemoryBackplane`] in-process.
//!
//! Every operation is best-effort. Publish failures are logged and dropped,
//! malformed envelopes are discarded, and a backplane that cannot be reached at
//! startup turns the bridge into a no-op so the hub keeps routing locally.

pub mod memory;
pub mod redis;

use std::sync::Arc;

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::{BackplaneConfig, identity_channel},
    hub::HubHandle,
    message::{Envelope, NodeId, Origin, RoutedMessage},
};

/// Messages buffered between a subscription pump and its forwarder.
pub(crate) const FEED_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum BackplaneError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("backplane did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// A publish/subscribe service shared by every node.
///
/// Neither method may block: the hub loop calls both while it owns the
/// registry.
pub trait Backplane: Send + Sync {
    /// Queues `payload` for publication on `channel`. Failures are logged by the
    /// implementation, never reported.
    fn publish(&self, channel: &str, payload: String);

    /// Starts receiving raw payloads published on `channel`.
    fn subscribe(&self, channel: &str) -> Feed;
}

/// Raw payloads from one channel subscription.
///
/// Dropping the feed stops the task that pumps messages into it.
pub struct Feed {
    messages: mpsc::Receiver<String>,
    pump: JoinHandle<()>,
}

impl Feed {
    pub fn new(messages: mpsc::Receiver<String>, pump: JoinHandle<()>) -> Self {
        Self { messages, pump }
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.messages.recv().await
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// A running forwarder from a [`Feed`] into the hub.
///
/// Cancelled when dropped; the forwarder owns the feed, so its pump stops too.
pub struct Listener {
    task: JoinHandle<()>,
}

impl Listener {
    fn spawn<F>(forwarder: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            task: tokio::spawn(forwarder),
        }
    }

    /// Requests cancellation and returns without waiting for the task.
    ///
    /// The forwarder stops at its next suspension point. A message it was
    /// already handing to the hub may still be routed after this returns.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The hub's view of the backplane.
pub struct Bridge {
    backplane: Option<Arc<dyn Backplane>>,
    channel: String,
    node_id: NodeId,
}

impl Bridge {
    /// Probes redis once. When it cannot be reached the bridge is disabled for
    /// the lifetime of the process.
    pub async fn connect(config: &BackplaneConfig, node_id: NodeId) -> Self {
        match redis::RedisBackplane::connect(config).await {
            Ok(backplane) => {
                info!(address = %config.address, channel = %config.channel, "backplane connected");
                Self::new(Arc::new(backplane), config.channel.clone(), node_id)
            }
            Err(err) => {
                warn!(
                    address = %config.address,
                    error = %err,
                    "backplane unavailable, routing single-node only"
                );
                Self::disabled(node_id)
            }
        }
    }

    pub fn new(backplane: Arc<dyn Backplane>, channel: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            backplane: Some(backplane),
            channel: channel.into(),
            node_id,
        }
    }

    pub fn disabled(node_id: NodeId) -> Self {
        Self {
            backplane: None,
            channel: String::new(),
            node_id,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_enabled(&self) -> bool {
        self.backplane.is_some()
    }

    /// Publishes a locally originated message on the shared channel.
    pub fn publish_routed(&self, message: &RoutedMessage) {
        let Some(backplane) = &self.backplane else {
            return;
        };
        let envelope = Envelope::new(
            &message.group,
            &message.identity,
            &message.payload,
            &self.node_id,
        );
        match envelope.encode() {
            Ok(raw) => backplane.publish(&self.channel, raw),
            Err(err) => warn!(error = %err, "failed to encode envelope"),
        }
    }

    /// Publishes directly on an identity channel, bypassing local routing.
    ///
    /// Returns `false` when the bridge is disabled.
    pub fn publish_to_identity(&self, identity: &str, payload: &[u8]) -> bool {
        let Some(backplane) = &self.backplane else {
            return false;
        };
        let envelope = Envelope::new("", identity, payload, &self.node_id);
        match envelope.encode() {
            Ok(raw) => {
                backplane.publish(&identity_channel(identity), raw);
                true
            }
            Err(err) => {
                warn!(%identity, error = %err, "failed to encode envelope");
                false
            }
        }
    }

    /// Subscribes the shared channel and forwards other nodes' messages to `hub`.
    pub fn listen_shared(&self, hub: HubHandle) -> Option<Listener> {
        let backplane = self.backplane.as_ref()?;
        let feed = backplane.subscribe(&self.channel);
        Some(Listener::spawn(forward_shared(
            feed,
            self.node_id.clone(),
            hub,
        )))
    }

    /// Subscribes one identity channel and forwards its messages to `hub` as
    /// identity-scoped messages that are never re-published.
    pub fn listen_identity(&self, identity: &str, hub: HubHandle) -> Option<Listener> {
        let backplane = self.backplane.as_ref()?;
        let feed = backplane.subscribe(&identity_channel(identity));
        Some(Listener::spawn(forward_identity(
            feed,
            identity.to_string(),
            self.node_id.clone(),
            hub,
        )))
    }
}

async fn forward_shared(mut feed: Feed, node_id: NodeId, hub: HubHandle) {
    while let Some(raw) = feed.recv().await {
        let envelope = match Envelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "discarding malformed envelope");
                continue;
            }
        };
        // Redis echoes our own publishes back to us.
        if envelope.is_from(&node_id) {
            continue;
        }
        let message = match envelope.into_routed() {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "discarding malformed envelope");
                continue;
            }
        };
        if !hub.route(message).await {
            break;
        }
    }
    debug!("shared channel listener stopped");
}

async fn forward_identity(mut feed: Feed, identity: String, node_id: NodeId, hub: HubHandle) {
    while let Some(raw) = feed.recv().await {
        let envelope = match Envelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(%identity, error = %err, "discarding malformed envelope");
                continue;
            }
        };
        if envelope.is_from(&node_id) {
            continue;
        }
        let payload = match envelope.payload_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%identity, error = %err, "discarding malformed envelope");
                continue;
            }
        };
        debug!(%identity, origin = %envelope.origin, "identity channel message");
        let message = RoutedMessage {
            group: String::new(),
            identity: identity.clone(),
            payload,
            origin: Origin::IdentityChannel,
        };
        if !hub.route(message).await {
            break;
        }
    }
    debug!(%identity, "identity channel listener stopped");
}
