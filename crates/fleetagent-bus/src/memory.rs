use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use crate::{Delivery, Subscription, Transport, TransportError};

type Subscriber = mpsc::Sender<Delivery>;

/// In-process transport keyed by exact subject.
///
/// A full subscriber queue drops the message, the same way a broker drops
/// for a slow consumer.
#[derive(Clone)]
pub struct MemoryBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish with an explicit reply subject.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<String>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let delivery = Delivery {
            subject: subject.to_string(),
            reply,
            payload,
        };
        let mut subs = self.subscribers.write().await;
        if let Some(subscribers) = subs.get_mut(subject) {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                let _ = tx.try_send(delivery.clone());
            }
        }
        Ok(())
    }

    /// Send a request on `subject` and wait for the first reply on a fresh inbox.
    pub async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        wait: Duration,
    ) -> Result<Bytes, TransportError> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut rx = self.subscribe(&inbox).await?;
        self.publish_with_reply(subject, Some(inbox.clone()), payload)
            .await?;
        let reply = tokio::time::timeout(wait, rx.recv()).await;
        self.subscribers.write().await.remove(&inbox);
        reply
            .ok()
            .flatten()
            .map(|d| d.payload)
            .ok_or(TransportError::Timeout(inbox))
    }

    pub async fn subscriber_count(&self, subject: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(subject)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        subs.entry(subject.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.publish_with_reply(subject, None, payload).await
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
