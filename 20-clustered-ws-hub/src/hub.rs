//! The coordination loop.
//!
//! All registry mutations and routing decisions happen on one task, in the
//! order events were submitted. Connections, backplane listeners, and the HTTP
//! boundary only ever talk to it through a [`HubHandle`], so the registry and
//! the identity subscription table need no locks.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    sync::Arc,
};

use bytes::Bytes;
use serde::Serialize;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::{
    backplane::{Bridge, Listener},
    config::HubConfig,
    connection::{ConnectionId, Delivery, Peer},
    message::{NodeId, Origin, RoutedMessage},
    registry::Registry,
};

pub enum HubEvent {
    Register(Peer),
    Unregister(ConnectionId),
    Route(RoutedMessage),
    Stats(oneshot::Sender<HubStats>),
}

/// Point-in-time view of the hub, taken on the hub loop.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub node_id: String,
    pub backplane: bool,
    pub connections: usize,
    pub groups: BTreeMap<String, usize>,
    pub identities: BTreeMap<String, usize>,
    /// Reference count per identity subscription.
    pub identity_subscriptions: BTreeMap<String, usize>,
}

/// Cloneable entry point into a running [`Hub`].
///
/// The async methods return `false` once the hub loop has stopped.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    bridge: Arc<Bridge>,
}

impl HubHandle {
    pub fn node_id(&self) -> &NodeId {
        self.bridge.node_id()
    }

    pub async fn register(&self, peer: Peer) -> bool {
        self.submit(HubEvent::Register(peer)).await
    }

    /// Safe to call for connections that were already removed.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        self.submit(HubEvent::Unregister(id)).await
    }

    pub async fn route(&self, message: RoutedMessage) -> bool {
        self.submit(HubEvent::Route(message)).await
    }

    /// Builds a message first observed by this node.
    pub fn local_message(&self, group: &str, identity: &str, payload: Bytes) -> RoutedMessage {
        RoutedMessage {
            group: group.to_string(),
            identity: identity.to_string(),
            payload,
            origin: Origin::Node(self.node_id().clone()),
        }
    }

    /// Delivers `payload` to every connection of `identity` on every node.
    pub async fn send_to_user(&self, identity: &str, payload: Bytes) -> bool {
        if identity.is_empty() {
            return false;
        }
        self.route(self.local_message("", identity, payload)).await
    }

    /// Publishes straight onto each identity's backplane channel.
    ///
    /// Local routing is bypassed, so only other nodes' connections receive it.
    /// Returns how many channels were published to.
    pub fn publish_to_identities<I, S>(&self, identities: I, payload: &[u8]) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        identities
            .into_iter()
            .filter(|identity| {
                let identity: &str = identity.as_ref();
                !identity.is_empty() && self.bridge.publish_to_identity(identity, payload)
            })
            .count()
    }

    pub async fn stats(&self) -> Option<HubStats> {
        let (reply, stats) = oneshot::channel();
        if !self.submit(HubEvent::Stats(reply)).await {
            return None;
        }
        stats.await.ok()
    }

    async fn submit(&self, event: HubEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

struct IdentitySubscription {
    refs: usize,
    listener: Option<Listener>,
}

pub struct Hub {
    events: mpsc::Receiver<HubEvent>,
    handle: HubHandle,
    bridge: Arc<Bridge>,
    registry: Registry,
    subscriptions: HashMap<String, IdentitySubscription>,
}

impl Hub {
    pub fn new(bridge: Bridge, config: HubConfig) -> Self {
        let (tx, events) = mpsc::channel(config.event_buffer);
        let bridge = Arc::new(bridge);
        let handle = HubHandle {
            events: tx,
            bridge: Arc::clone(&bridge),
        };
        Self {
            events,
            handle,
            bridge,
            registry: Registry::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Processes events until `shutdown` resolves.
    ///
    /// On exit every listener is cancelled and every outbound queue closed.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let _shared = self.bridge.listen_shared(self.handle.clone());
        info!(
            node = %self.bridge.node_id(),
            backplane = self.bridge.is_enabled(),
            "hub running"
        );
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.subscriptions.clear();
        info!(connections = self.registry.len(), "hub stopped");
    }

    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(peer) => self.register(peer),
            HubEvent::Unregister(id) => match self.unregister(id) {
                Some(peer) => debug!(connection = %id, identity = %peer.identity(), "unregistered"),
                None => debug!(connection = %id, "already unregistered"),
            },
            HubEvent::Route(message) => self.route(message),
            HubEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn register(&mut self, peer: Peer) {
        let identity = peer.identity().to_string();
        if self.registry.insert(peer) {
            self.acquire_subscription(&identity);
        }
    }

    fn unregister(&mut self, id: ConnectionId) -> Option<Peer> {
        let peer = self.registry.remove(id)?;
        self.release_subscription(peer.identity());
        Some(peer)
    }

    fn route(&mut self, message: RoutedMessage) {
        // Only the node that first saw a message publishes it.
        if message.origin.is_node(self.bridge.node_id()) {
            self.bridge.publish_routed(&message);
        }

        let mut reached = HashSet::new();
        if !message.group.is_empty() {
            for id in self.registry.group_members(&message.group) {
                if self.deliver(id, &message.payload) {
                    reached.insert(id);
                }
            }
        }
        if !message.identity.is_empty() {
            for id in self.registry.identity_members(&message.identity) {
                if !reached.contains(&id) {
                    self.deliver(id, &message.payload);
                }
            }
        }
    }

    /// Enqueues without waiting. A connection that cannot take the payload is
    /// removed on the spot; its loops notice when the queue closes.
    fn deliver(&mut self, id: ConnectionId, payload: &Bytes) -> bool {
        let Some(peer) = self.registry.get(id) else {
            return false;
        };
        match peer.try_deliver(payload.clone()) {
            Delivery::Queued => true,
            Delivery::Full => {
                if let Some(peer) = self.unregister(id) {
                    warn!(
                        connection = %id,
                        identity = %peer.identity(),
                        group = %peer.group(),
                        "outbound queue full, dropping stalled connection"
                    );
                }
                false
            }
            Delivery::Closed => {
                self.unregister(id);
                debug!(connection = %id, "writer gone, dropping connection");
                false
            }
        }
    }

    fn acquire_subscription(&mut self, identity: &str) {
        if let Some(subscription) = self.subscriptions.get_mut(identity) {
            subscription.refs += 1;
            return;
        }
        let listener = self.bridge.listen_identity(identity, self.handle.clone());
        self.subscriptions.insert(
            identity.to_string(),
            IdentitySubscription { refs: 1, listener },
        );
    }

    /// Tears the subscription down in this same turn when the count hits zero.
    fn release_subscription(&mut self, identity: &str) {
        let Some(subscription) = self.subscriptions.get_mut(identity) else {
            return;
        };
        subscription.refs -= 1;
        if subscription.refs > 0 {
            return;
        }
        if let Some(IdentitySubscription {
            listener: Some(listener),
            ..
        }) = self.subscriptions.remove(identity)
        {
            listener.cancel();
            debug!(%identity, "identity subscription cancelled");
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            node_id: self.bridge.node_id().to_string(),
            backplane: self.bridge.is_enabled(),
            connections: self.registry.len(),
            groups: self.registry.group_sizes().into_iter().collect(),
            identities: self.registry.identity_sizes().into_iter().collect(),
            identity_subscriptions: self
                .subscriptions
                .iter()
                .map(|(identity, subscription)| (identity.clone(), subscription.refs))
                .collect(),
        }
    }
}
