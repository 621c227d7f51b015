use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fleetagent_bus::{codec, Delivery, Responder, Subscription};
use fleetagent_schema::Command;
use tokio::task::{JoinHandle, JoinSet};

use crate::AgentContext;

/// A handler for one command discriminant.
///
/// Handlers reply through `reply`; returning `Err` makes the dispatcher send
/// the stringified error if nothing was replied yet.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: Arc<AgentContext>, cmd: Command, reply: Responder) -> Result<()>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Arc<AgentContext>, Command, Responder) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: Arc<AgentContext>, cmd: Command, reply: Responder) -> Result<()> {
        (self)(ctx, cmd, reply).await
    }
}

/// Static command name to handler table.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<H>(&mut self, name: &'static str, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(name, Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// How long `Dispatcher::run` waits for in-flight handlers after it stops
/// receiving. Handlers still running then are aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Decodes inbound deliveries and runs each matching handler on its own task.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<AgentContext>,
    handlers: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<AgentContext>, handlers: HandlerRegistry) -> Self {
        Self {
            ctx,
            handlers: Arc::new(handlers),
        }
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Route one delivery. Returns the spawned handler task, or `None` when
    /// the delivery was dropped (undecodable or unknown command).
    pub fn dispatch(&self, delivery: Delivery) -> Option<JoinHandle<()>> {
        self.handler_task(delivery).map(tokio::spawn)
    }

    fn handler_task(&self, delivery: Delivery) -> Option<impl Future<Output = ()> + Send + 'static> {
        let cmd: Command = match codec::decode(&delivery.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(subject = %delivery.subject, error = %e, "dropping undecodable command");
                return None;
            }
        };

        let Some(handler) = self.handlers.get(&cmd.name) else {
            tracing::debug!(command = %cmd.name, "ignoring unknown command");
            return None;
        };

        let reply = Responder::new(self.ctx.transport.clone(), delivery.reply);
        let ctx = self.ctx.clone();
        Some(async move {
            let name = cmd.name.clone();
            tracing::debug!(command = %name, "dispatching command");
            if let Err(e) = handler.handle(ctx, cmd, reply.clone()).await {
                let message = format!("{e:#}");
                tracing::error!(command = %name, error = %message, "command failed");
                if !reply.has_replied() {
                    if let Err(send_err) = reply.send(&message).await {
                        tracing::warn!(command = %name, error = %send_err, "could not send error reply");
                    }
                }
            }
        })
    }

    /// Receive until the subscription closes or the agent begins shutting
    /// down, then wait up to [`SHUTDOWN_GRACE`] for in-flight handlers.
    pub async fn run(&self, mut subscription: Subscription) {
        let mut stopping = self.ctx.lifecycle.subscribe_stop();
        let mut in_flight = JoinSet::new();
        tracing::info!(handlers = self.handlers.len(), "dispatcher started");
        loop {
            tokio::select! {
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => {
                        if let Some(task) = self.handler_task(delivery) {
                            in_flight.spawn(task);
                        }
                    }
                    None => {
                        tracing::info!("subscription closed, dispatcher stopping");
                        break;
                    }
                },
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = stopping.wait_for(|stop| *stop) => {
                    tracing::info!("shutdown requested, dispatcher stopping");
                    break;
                }
            }
        }
        drain_handlers(in_flight).await;
    }
}

async fn drain_handlers(mut in_flight: JoinSet<()>) {
    if in_flight.is_empty() {
        return;
    }
    tracing::info!(pending = in_flight.len(), "waiting for in-flight handlers");
    let all_done = async {
        while in_flight.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, all_done).await.is_err() {
        tracing::warn!(pending = in_flight.len(), "aborting handlers still running after shutdown grace");
    }
}
