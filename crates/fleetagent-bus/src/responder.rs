use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::{codec, Transport, TransportError};

/// Reply handle for one inbound message.
///
/// Clones share state: whichever clone sends first wins and every later send
/// is a no-op. Without a reply subject every send is a no-op.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    reply_to: Option<String>,
    sent: AtomicBool,
}

impl Responder {
    pub fn new(transport: Arc<dyn Transport>, reply_to: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                reply_to,
                sent: AtomicBool::new(false),
            }),
        }
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.inner.reply_to.as_deref()
    }

    pub fn has_replied(&self) -> bool {
        self.inner.sent.load(Ordering::Acquire)
    }

    /// Encode and publish `value`. Returns `Ok(false)` when nothing was sent.
    pub async fn send<T>(&self, value: &T) -> Result<bool, TransportError>
    where
        T: Serialize + ?Sized,
    {
        let Some(reply_to) = self.inner.reply_to.as_deref() else {
            return Ok(false);
        };
        let bytes = codec::encode(value)?;
        if self
            .inner
            .sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(reply_to, "reply already sent; dropping duplicate");
            return Ok(false);
        }
        self.inner
            .transport
            .publish(reply_to, Bytes::from(bytes))
            .await?;
        Ok(true)
    }

    /// Send and push the reply out to the server before returning.
    pub async fn send_and_flush<T>(&self, value: &T) -> Result<bool, TransportError>
    where
        T: Serialize + ?Sized,
    {
        let sent = self.send(value).await?;
        self.inner.transport.flush().await?;
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBus;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn sends_at_most_once() {
        let bus = Arc::new(MemoryBus::new(8));
        let mut rx = bus.subscribe("inbox.1").await.unwrap();
        let responder = Responder::new(bus.clone(), Some("inbox.1".into()));
        let clone = responder.clone();

        assert!(responder.send("first").await.unwrap());
        assert!(!clone.send("second").await.unwrap());
        assert!(clone.has_replied());

        let got = timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let text: String = codec::decode(&got.payload).unwrap();
        assert_eq!(text, "first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_reply_subject_is_a_noop() {
        let bus = Arc::new(MemoryBus::new(8));
        let responder = Responder::new(bus, None);
        assert!(!responder.send("ignored").await.unwrap());
        assert!(!responder.has_replied());
    }
}
