//! One streaming session: its registry entry and its two loops.
//!
//! The read loop turns inbound frames into routed messages for the hub. The
//! write loop drains the outbound queue and sends keepalive pings. The queue is
//! the only state the two share with the hub: the hub owns the producer side
//! (inside [`Peer`]) and closes it by dropping the peer, which the write loop
//! observes as the end of the queue.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    time::{Instant, MissedTickBehavior, interval_at, timeout, timeout_at},
};
use tracing::{debug, info, warn};

use crate::{config::ConnectionSettings, hub::HubHandle};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The consumer is not keeping up.
    Full,
    /// The write loop is gone.
    Closed,
}

/// Registry entry for a connection. Holds the producer side of its queue.
#[derive(Debug)]
pub struct Peer {
    id: ConnectionId,
    identity: String,
    group: String,
    outbound: mpsc::Sender<Bytes>,
}

impl Peer {
    /// Creates a peer with a fresh id and its bounded outbound queue.
    pub fn new(
        identity: impl Into<String>,
        group: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, queue) = mpsc::channel(capacity);
        let peer = Self {
            id: ConnectionId::next(),
            identity: identity.into(),
            group: group.into(),
            outbound,
        };
        (peer, queue)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn try_deliver(&self, payload: Bytes) -> Delivery {
        match self.outbound.try_send(payload) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Runs a websocket session until either loop ends, then unregisters it.
pub async fn serve(
    socket: WebSocket,
    hub: HubHandle,
    identity: String,
    group: String,
    settings: ConnectionSettings,
) {
    let (sink, frames) = socket.split();
    let (peer, queue) = Peer::new(identity.as_str(), group.as_str(), settings.queue_capacity);
    let id = peer.id();

    if !hub.register(peer).await {
        warn!(connection = %id, "hub stopped, refusing connection");
        return;
    }
    info!(connection = %id, %identity, %group, "connection registered");

    let mut writer = tokio::spawn(write_loop(sink, queue, settings));

    select! {
        result = read_loop(frames, &hub, &identity, &group, settings.pong_wait) => {
            if let Err(err) = result {
                debug!(connection = %id, error = %err, "read loop ended");
            }
        }
        result = &mut writer => {
            match result {
                Ok(Ok(())) => debug!(connection = %id, "write loop closed"),
                Ok(Err(err)) => debug!(connection = %id, error = %err, "write loop ended"),
                Err(err) => warn!(connection = %id, error = %err, "write loop panicked"),
            }
        }
    }

    // Closes the queue if the hub has not already reaped us; the writer then
    // sends a close frame and exits on its own.
    hub.unregister(id).await;
    info!(connection = %id, %identity, %group, "connection closed");
}

/// Forwards inbound frames to the hub until the peer closes, errors, or stops
/// answering pings within `pong_wait`.
pub async fn read_loop<R, E>(
    mut frames: R,
    hub: &HubHandle,
    identity: &str,
    group: &str,
    pong_wait: Duration,
) -> Result<()>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let mut deadline = Instant::now() + pong_wait;
    loop {
        let frame = match timeout_at(deadline, frames.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => bail!("read failed: {err}"),
            Ok(None) => return Ok(()),
            Err(_) => bail!("no pong within {pong_wait:?}"),
        };

        let payload = match frame {
            Message::Text(text) => Bytes::from(text),
            Message::Binary(data) => Bytes::from(data),
            Message::Pong(_) => {
                deadline = Instant::now() + pong_wait;
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(_) => return Ok(()),
        };

        // Echo semantics: the sender's own group receives the message too.
        if !hub.route(hub.local_message(group, identity, payload)).await {
            bail!("hub stopped");
        }
    }
}

/// Drains the outbound queue into `sink` and pings every `ping_interval`.
///
/// Ends with a close frame once the queue is closed, or with an error when a
/// write fails or exceeds `write_timeout`.
pub async fn write_loop<W>(
    mut sink: W,
    mut queue: mpsc::Receiver<Bytes>,
    settings: ConnectionSettings,
) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let mut keepalive = interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            next = queue.recv() => match next {
                Some(payload) => {
                    send_frame(&mut sink, payload_frame(payload), settings.write_timeout).await?;
                }
                None => {
                    let close = Message::Close(None);
                    let _ = send_frame(&mut sink, close, settings.write_timeout).await;
                    return Ok(());
                }
            },
            _ = keepalive.tick() => {
                send_frame(&mut sink, Message::Ping(Vec::new()), settings.write_timeout).await?;
            }
        }
    }
}

fn payload_frame(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

async fn send_frame<W>(sink: &mut W, message: Message, limit: Duration) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(anyhow!("write failed: {err}")),
        Err(_) => Err(anyhow!("write exceeded {limit:?}")),
    }
}
