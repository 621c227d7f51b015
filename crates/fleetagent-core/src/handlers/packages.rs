use std::sync::Arc;

use anyhow::{anyhow, Result};
use fleetagent_bus::Responder;
use fleetagent_schema::{Command, REPLY_BUSY, REPLY_OK};
use serde_json::json;

use crate::controller::{
    os_updates_install_path, os_updates_path, package_result_path, PACKAGE_MANAGER_PATH,
};
use crate::{AgentContext, GuardName};

/// Fire-and-forget: the outcome is posted to the controller.
pub(super) async fn install_package_manager(
    ctx: Arc<AgentContext>,
    _cmd: Command,
    _reply: Responder,
) -> Result<()> {
    let status = ctx.host.install_package_manager().await;
    tracing::info!(manager = %status.name, installed = status.installed, "package manager check");
    ctx.controller
        .post_json(
            PACKAGE_MANAGER_PATH,
            &json!({
                "agent_id": ctx.agent_id(),
                "installed": status.installed,
                "package_manager": status.name,
            }),
        )
        .await
}

/// Acknowledge, install, then PATCH the installer output to the pending action.
pub(super) async fn install_package(
    ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let name = cmd
        .package_name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| anyhow!("install-package requires a package name"))?;
    let pending = cmd
        .pending_action_pk
        .ok_or_else(|| anyhow!("install-package requires a pending action"))?;
    reply.send(REPLY_OK).await?;

    let results = match ctx.host.install_package(&name).await {
        Ok(out) => out,
        Err(e) => format!("{e:#}"),
    };
    tracing::info!(package = %name, pending, "package install finished");
    ctx.controller
        .patch_json(&package_result_path(pending), &json!({ "results": results }))
        .await
}

pub(super) async fn get_os_updates(
    ctx: Arc<AgentContext>,
    _cmd: Command,
    reply: Responder,
) -> Result<()> {
    let Some(_permit) = ctx.guards.try_hold(GuardName::OsUpdateScan) else {
        tracing::debug!("already checking for os updates");
        reply.send(REPLY_BUSY).await?;
        return Ok(());
    };
    reply.send(REPLY_OK).await?;

    tracing::debug!("checking for os updates");
    let updates = ctx.host.os_updates().await?;
    ctx.controller
        .post_json(
            &os_updates_path(ctx.agent_id()),
            &json!({ "agent_id": ctx.agent_id(), "updates": updates }),
        )
        .await
}

pub(super) async fn install_os_updates(
    ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let Some(_permit) = ctx.guards.try_hold(GuardName::OsUpdateInstall) else {
        tracing::debug!("already installing os updates");
        reply.send(REPLY_BUSY).await?;
        return Ok(());
    };
    reply.send(REPLY_OK).await?;

    tracing::info!(updates = ?cmd.update_ids, "installing os updates");
    let (success, output) = match ctx.host.install_os_updates(&cmd.update_ids).await {
        Ok(out) => (true, out),
        Err(e) => (false, format!("{e:#}")),
    };
    ctx.controller
        .post_json(
            &os_updates_install_path(ctx.agent_id()),
            &json!({
                "agent_id": ctx.agent_id(),
                "guids": cmd.update_ids,
                "success": success,
                "output": output,
            }),
        )
        .await
}
