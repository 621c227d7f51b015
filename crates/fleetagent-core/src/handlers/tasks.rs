use std::sync::Arc;

use anyhow::{anyhow, Result};
use fleetagent_bus::Responder;
use fleetagent_schema::{Command, TaskPayload, REPLY_OK};

use crate::AgentContext;

fn task_payload(cmd: &Command) -> Result<&TaskPayload> {
    cmd.scheduled_task
        .as_ref()
        .ok_or_else(|| anyhow!("{} requires a scheduled task payload", cmd.name))
}

pub(super) async fn add(ctx: Arc<AgentContext>, cmd: Command, reply: Responder) -> Result<()> {
    let payload = task_payload(&cmd)?;
    if !ctx.tasks.create_from_payload(payload).await? {
        return Err(anyhow!("scheduled task {} was not registered", payload.name));
    }
    reply.send(REPLY_OK).await?;
    Ok(())
}

pub(super) async fn delete(ctx: Arc<AgentContext>, cmd: Command, reply: Responder) -> Result<()> {
    let payload = task_payload(&cmd)?;
    ctx.tasks.delete(&payload.name).await?;
    reply.send(REPLY_OK).await?;
    Ok(())
}

pub(super) async fn enable(ctx: Arc<AgentContext>, cmd: Command, reply: Responder) -> Result<()> {
    let payload = task_payload(&cmd)?;
    ctx.tasks.enable(&payload.name, payload.enabled).await?;
    reply.send(REPLY_OK).await?;
    Ok(())
}

pub(super) async fn list(ctx: Arc<AgentContext>, _cmd: Command, reply: Responder) -> Result<()> {
    let names = ctx.tasks.list().await;
    tracing::debug!(count = names.len(), "listing scheduled tasks");
    reply.send(&names).await?;
    Ok(())
}
