use crate::{error::SinkError, publisher::MessageBroker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 1024;

/// In-process pub/sub keyed by channel name. Publishing to a channel
/// nobody listens on succeeds and the message is lost.
#[derive(Default)]
pub struct LocalBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender(channel).subscribe()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBroker for LocalBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        // A send error only means there are no subscribers right now.
        if self.sender(channel).send(payload).is_err() {
            trace!(channel, "no local subscribers, record dropped");
        }
        Ok(())
    }
}
