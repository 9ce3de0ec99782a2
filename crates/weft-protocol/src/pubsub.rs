//! Topic publication collaborator.
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::ProtocolError;

/// Fan-out of envelopes published to a topic.
#[async_trait::async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), ProtocolError>;
}

/// In-process pub/sub over one broadcast channel per topic.
pub struct MemoryPubSub {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MemoryPubSub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>> {
        self.topics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[async_trait::async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), ProtocolError> {
        let sender = self
            .topics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(topic)
            .cloned();
        match sender {
            // Nobody listening is not an error for a broadcast.
            None => Ok(()),
            Some(tx) => {
                let _ = tx.send(data);
                Ok(())
            }
        }
    }
}
