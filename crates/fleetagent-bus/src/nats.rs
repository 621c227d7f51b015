use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{Delivery, Subscription, Transport, TransportError};

const FORWARD_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct NatsOptions {
    pub url: String,
    /// Connection name shown in server monitoring.
    pub name: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Extra CA bundle; when set TLS is required.
    pub root_cert: Option<PathBuf>,
}

pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    pub async fn connect(opts: NatsOptions) -> Result<Self, TransportError> {
        let mut options = async_nats::ConnectOptions::new().name(&opts.name);
        if let (Some(user), Some(password)) = (opts.user.clone(), opts.password.clone()) {
            options = options.user_and_password(user, password);
        }
        if let Some(ca) = opts.root_cert.clone() {
            options = options.add_root_certificates(ca).require_tls(true);
        }

        let client = options
            .connect(opts.url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: opts.url.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(url = %opts.url, "connected to message bus");
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TransportError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let delivery = Delivery {
                    subject: msg.subject.to_string(),
                    reply: msg.reply.map(|r| r.to_string()),
                    payload: msg.payload,
                };
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            tracing::debug!("nats subscription stream ended");
        });
        Ok(rx)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TransportError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::Flush(e.to_string()))
    }
}
