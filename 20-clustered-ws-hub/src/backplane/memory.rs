use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{Backplane, FEED_BUFFER, Feed};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process backplane for running several hubs in one process.
///
/// Channels are created lazily on first subscribe. Publishing to a channel
/// nobody subscribes to drops the message, as redis does.
#[derive(Default)]
pub struct MemoryBackplane {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or_default()
    }
}

impl Backplane for MemoryBackplane {
    fn publish(&self, channel: &str, payload: String) {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = channels.get(channel) {
            // No receivers is not an error for pub/sub.
            let _ = sender.send(payload);
        }
    }

    fn subscribe(&self, channel: &str) -> Feed {
        let mut receiver = {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let channel = channel.to_string();
        let pump = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%channel, skipped, "memory backplane subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Feed::new(rx, pump)
    }
}
