use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fleetagent_bus::Responder;
use fleetagent_runtime::{list_processes, run_raw, run_script};
use fleetagent_schema::{Command, REPLY_OK};

use crate::jobs::run_script_result;
use crate::AgentContext;

const DEFAULT_RAW_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 120;
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(300);

pub(super) async fn list(_ctx: Arc<AgentContext>, _cmd: Command, reply: Responder) -> Result<()> {
    let procs = tokio::task::spawn_blocking(list_processes)
        .await
        .context("process listing aborted")?
        .context("failed to read process table")?;
    reply.send(&procs).await?;
    Ok(())
}

pub(super) async fn kill(_ctx: Arc<AgentContext>, cmd: Command, reply: Responder) -> Result<()> {
    let pid = cmd
        .pid
        .ok_or_else(|| anyhow!("process-kill requires a pid"))?;
    tokio::task::spawn_blocking(move || fleetagent_runtime::kill(pid))
        .await
        .context("process kill aborted")??;
    tracing::info!(pid, "process killed on request");
    reply.send(REPLY_OK).await?;
    Ok(())
}

/// Replies stderr when the command wrote any, stdout otherwise.
pub(super) async fn run_raw_command(
    _ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let command = cmd
        .arg("command")
        .ok_or_else(|| anyhow!("run-raw-command requires a command"))?;
    let shell = cmd.arg("shell").unwrap_or_default();
    let timeout = Duration::from_secs(cmd.timeout_or(DEFAULT_RAW_TIMEOUT_SECS));

    let out = run_raw(shell, command, timeout).await?;
    tracing::debug!(exit_code = out.exit_code, timed_out = out.timed_out, "raw command finished");
    if out.stderr.is_empty() {
        reply.send(&out.stdout).await?;
    } else {
        reply.send(&out.stderr).await?;
    }
    Ok(())
}

/// Replies stdout and stderr concatenated.
pub(super) async fn script_run(_ctx: Arc<AgentContext>, cmd: Command, reply: Responder) -> Result<()> {
    let code = cmd.arg("code").unwrap_or_default();
    let shell = cmd.arg("shell").unwrap_or_default();
    let timeout = Duration::from_secs(cmd.timeout_or(DEFAULT_SCRIPT_TIMEOUT_SECS));

    let out = run_script(shell, code, &cmd.script_args, timeout).await?;
    reply.send(&out.combined()).await?;
    Ok(())
}

pub(super) async fn script_run_full(
    _ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let result = run_script_result(
        cmd.arg("shell").unwrap_or_default(),
        cmd.arg("code").unwrap_or_default(),
        &cmd.script_args,
        cmd.timeout_or(DEFAULT_SCRIPT_TIMEOUT_SECS),
    )
    .await;
    reply.send(&result).await?;
    Ok(())
}

/// Acknowledge first; the recovery command may restart the agent.
pub(super) async fn recovery_command(
    ctx: Arc<AgentContext>,
    cmd: Command,
    reply: Responder,
) -> Result<()> {
    let command = cmd
        .recovery_command
        .clone()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| anyhow!("recoverycmd requires a recovery command"))?;
    reply.send(REPLY_OK).await?;
    if let Err(e) = ctx.transport.flush().await {
        tracing::warn!(error = %e, "flush before recovery command failed");
    }

    tracing::info!(command = %command, "running recovery command");
    let out = run_raw("sh", &command, RECOVERY_TIMEOUT).await?;
    if !out.success() {
        tracing::warn!(exit_code = out.exit_code, stderr = %out.stderr.trim(), "recovery command failed");
    }
    Ok(())
}
