use std::time::Duration;

use ::redis::{AsyncCommands, Client, aio::ConnectionManager};
use futures::StreamExt;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::timeout,
};
use tracing::{debug, warn};

use super::{Backplane, BackplaneError, FEED_BUFFER, Feed};
use crate::config::BackplaneConfig;

/// Redis pub/sub backplane.
///
/// Publishes go through one background task that owns a multiplexed
/// connection, so `publish` never waits on the network and messages leave in
/// the order they were queued. The queue is bounded and each round trip is
/// capped by `publish_timeout`; when redis stops answering, messages are
/// dropped instead of piling up. Each subscription gets its own dedicated
/// pub/sub connection, as redis requires.
pub struct RedisBackplane {
    client: Client,
    outgoing: mpsc::Sender<(String, String)>,
}

impl RedisBackplane {
    /// Connects and pings within `config.probe_timeout`.
    pub async fn connect(config: &BackplaneConfig) -> Result<Self, BackplaneError> {
        let client = Client::open(config.redis_url())?;
        let probe = config.probe_timeout;

        let mut connection = within(probe, ConnectionManager::new(client.clone())).await??;
        within(
            probe,
            ::redis::cmd("PING").query_async::<_, String>(&mut connection),
        )
        .await??;

        let (outgoing, queued) = mpsc::channel(FEED_BUFFER);
        tokio::spawn(run_publisher(connection, queued, config.publish_timeout));

        Ok(Self { client, outgoing })
    }

    /// Messages waiting for the publisher task.
    pub fn backlog(&self) -> usize {
        self.outgoing.max_capacity() - self.outgoing.capacity()
    }
}

impl Backplane for RedisBackplane {
    fn publish(&self, channel: &str, payload: String) {
        match self.outgoing.try_send((channel.to_string(), payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%channel, "redis publisher backlogged, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(%channel, "redis publisher stopped, dropping message");
            }
        }
    }

    fn subscribe(&self, channel: &str) -> Feed {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let client = self.client.clone();
        let channel = channel.to_string();
        let pump = tokio::spawn(async move {
            if let Err(err) = pump_channel(client, &channel, tx).await {
                warn!(%channel, error = %err, "redis subscription failed");
            }
        });
        Feed::new(rx, pump)
    }
}

async fn within<F: std::future::Future>(
    limit: Duration,
    future: F,
) -> Result<F::Output, BackplaneError> {
    timeout(limit, future)
        .await
        .map_err(|_| BackplaneError::Timeout(limit))
}

async fn run_publisher(
    mut connection: ConnectionManager,
    mut queued: mpsc::Receiver<(String, String)>,
    limit: Duration,
) {
    while let Some((channel, payload)) = queued.recv().await {
        match within(limit, connection.publish::<_, _, ()>(&channel, payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%channel, error = %err, "redis publish failed"),
            Err(err) => warn!(%channel, error = %err, "redis publish dropped"),
        }
    }
}

async fn pump_channel(
    client: Client,
    channel: &str,
    tx: mpsc::Sender<String>,
) -> Result<(), BackplaneError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    debug!(%channel, "redis subscription active");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%channel, error = %err, "skipping non-text redis payload");
                continue;
            }
        };
        if tx.send(payload).await.is_err() {
            break;
        }
    }
    Ok(())
}
