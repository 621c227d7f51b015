pub mod codec;
pub mod memory;
pub mod nats;
pub mod responder;

pub use codec::*;
pub use memory::*;
pub use nats::*;
pub use responder::*;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A raw message as handed over by the transport, before decoding.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    /// Reply subject, present when the sender expects an answer.
    pub reply: Option<String>,
    pub payload: Bytes,
}

pub type Subscription = mpsc::Receiver<Delivery>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("flush failed: {0}")]
    Flush(String),
    #[error("no reply on {0} before the deadline")]
    Timeout(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Publish/subscribe connection with request/reply addressing.
///
/// Implementations must deliver each message at most once and must not block
/// `publish` on slow subscribers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Wait until everything published so far has been handed to the server.
    async fn flush(&self) -> Result<(), TransportError>;
}
