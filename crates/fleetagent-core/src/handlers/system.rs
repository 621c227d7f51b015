use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use fleetagent_bus::Responder;
use fleetagent_runtime::{run_command, RunOptions};
use fleetagent_schema::{Command, REPLY_BUSY, REPLY_OK};

use crate::{jobs, AgentContext};

const CHECK_RUN_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_EVENT_LOG_DAYS: u32 = 1;

fn required<'a>(cmd: &'a Command, key: &str) -> Result<&'a str> {
    cmd.arg(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("{} requires `{key}`", cmd.name))
}

pub(super) async fn eventlog_query(
    ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let log_name = cmd.arg("logname").unwrap_or_default();
    let days = cmd
        .arg("days")
        .and_then(|d| d.parse().ok())
        .unwrap_or(DEFAULT_EVENT_LOG_DAYS);
    let records = ctx.host.event_log(log_name, days).await?;
    tracing::debug!(log_name, days, count = records.len(), "event log queried");
    reply.send(&records).await?;
    Ok(())
}

pub(super) async fn service_list(
    ctx: Arc<AgentContext>,
    _cmd: Command,
    reply: Responder,
) -> Result<()> {
    let services = ctx.host.services().await?;
    reply.send(&services).await?;
    Ok(())
}

pub(super) async fn service_detail(
    ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let detail = ctx.host.service_detail(required(&cmd, "name")?).await?;
    reply.send(&detail).await?;
    Ok(())
}

pub(super) async fn service_action(
    ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let name = required(&cmd, "name")?;
    let action = required(&cmd, "action")?;
    let result = ctx.host.service_action(name, action).await;
    tracing::info!(service = name, action, success = result.success, "service action");
    reply.send(&result).await?;
    Ok(())
}

pub(super) async fn service_edit(
    ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let name = required(&cmd, "name")?;
    let start_type = required(&cmd, "startType")?;
    let result = ctx.host.service_edit(name, start_type).await;
    reply.send(&result).await?;
    Ok(())
}

pub(super) async fn software_list(
    ctx: Arc<AgentContext>,
    _cmd: Command,
    reply: Responder,
) -> Result<()> {
    let software = ctx.host.software().await?;
    reply.send(&software).await?;
    Ok(())
}

/// Errors while probing read as "no reboot needed".
pub(super) async fn reboot_needed_check(
    ctx: Arc<AgentContext>,
    _cmd: Command,
    reply: Responder,
) -> Result<()> {
    let needed = match ctx.host.reboot_required().await {
        Ok(needed) => needed,
        Err(e) => {
            tracing::debug!(error = %e, "could not determine whether a reboot is needed");
            false
        }
    };
    reply.send(&needed).await?;
    Ok(())
}

pub(super) async fn cpu_load_average(
    ctx: Arc<AgentContext>,
    _cmd: Command,
    reply: Responder,
) -> Result<()> {
    let load = ctx.host.cpu_load_average().await?;
    reply.send(&load).await?;
    Ok(())
}

pub(super) async fn public_ip(ctx: Arc<AgentContext>, _cmd: Command, reply: Responder) -> Result<()> {
    let ip = ctx.host.public_ip().await?;
    reply.send(&ip).await?;
    Ok(())
}

pub(super) async fn system_info_refresh(
    ctx: Arc<AgentContext>,
    _cmd: Command,
    reply: Responder,
) -> Result<()> {
    jobs::send_sysinfo(&ctx).await?;
    reply.send(REPLY_OK).await?;
    Ok(())
}

/// Fire-and-forget: results go to the controller, not the bus.
pub(super) async fn sync_info(ctx: Arc<AgentContext>, _cmd: Command, _reply: Responder) -> Result<()> {
    tracing::debug!("sending system info and software");
    jobs::sync_info(&ctx).await
}

pub(super) async fn task_run(ctx: Arc<AgentContext>, cmd: Command, _reply: Responder) -> Result<()> {
    let task_id = cmd
        .task_id
        .ok_or_else(|| anyhow!("task-run requires a task id"))?;
    jobs::run_task(&ctx, task_id).await?;
    Ok(())
}

/// Replies "busy" while another check run is alive, otherwise "ok" and
/// starts one in a separate agent process.
pub(super) async fn run_checks(ctx: Arc<AgentContext>, _cmd: Command, reply: Responder) -> Result<()> {
    if ctx.host.checks_running().await {
        tracing::debug!("checks are already running");
        reply.send(REPLY_BUSY).await?;
        return Ok(());
    }
    reply.send(REPLY_OK).await?;

    let invocation = ctx.agent.invocation(&["run-checks"]);
    let opts = RunOptions {
        workdir: invocation.workdir,
        env: Vec::new(),
    };
    let out = run_command(&invocation.program, &invocation.args, CHECK_RUN_TIMEOUT, &opts).await?;
    if !out.success() {
        tracing::error!(exit_code = out.exit_code, stderr = %out.stderr.trim(), "check run failed");
    }
    Ok(())
}

/// `mode: agent` restarts the agent's own service unit after acknowledging.
pub(super) async fn recover_agent(
    ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    reply.send(REPLY_OK).await?;
    if cmd.arg("mode") == Some("agent") {
        tracing::info!("recovering agent service");
        if let Err(e) = ctx.transport.flush().await {
            tracing::warn!(error = %e, "flush before agent recovery failed");
        }
        ctx.host.restart_agent_service().await?;
    }
    Ok(())
}
