use std::sync::Arc;

use anyhow::Result;
use fleetagent_bus::Responder;
use fleetagent_schema::Command;

use crate::AgentContext;

pub(super) async fn self_update(ctx: Arc<AgentContext>, cmd: Command, reply: Responder) -> Result<()> {
    ctx.lifecycle.run_self_update(&ctx, &cmd, &reply).await
}

pub(super) async fn uninstall(ctx: Arc<AgentContext>, _cmd: Command, reply: Responder) -> Result<()> {
    ctx.lifecycle.run_uninstall(&ctx, &reply).await
}

pub(super) async fn reboot_now(ctx: Arc<AgentContext>, _cmd: Command, reply: Responder) -> Result<()> {
    ctx.lifecycle.run_reboot(&ctx, &reply).await
}
