//! Long-running work that reports to the controller over HTTP instead of
//! replying on the bus: task runs, check runs and inventory pushes.

use std::time::{Duration, Instant};

use anyhow::Result;
use fleetagent_runtime::run_script;
use fleetagent_schema::ScriptResult;
use serde::{Deserialize, Serialize};

use crate::controller::{
    checkrunner_path, software_path, sysinfo_path, taskrunner_path, CHECK_RESULTS_PATH,
};
use crate::AgentContext;

const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 120;

fn default_timeout() -> u64 {
    DEFAULT_SCRIPT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskScript {
    pub code: String,
    #[serde(alias = "interpreter")]
    pub shell: String,
}

/// A controller-defined script task fetched for `task-run`.
#[derive(Debug, Clone, Deserialize)]
pub struct AutomatedTask {
    pub script: TaskScript,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptCheck {
    pub id: i64,
    pub script: TaskScript,
    #[serde(default)]
    pub script_args: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckRunnerConfig {
    #[serde(default)]
    pub checks: Vec<ScriptCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct CheckResult<'a> {
    id: i64,
    agent_id: &'a str,
    #[serde(flatten)]
    result: ScriptResult,
}

/// Run a script and fold start failures into the result, so the caller
/// always has something to report.
pub async fn run_script_result(
    interpreter: &str,
    code: &str,
    args: &[String],
    timeout_secs: u64,
) -> ScriptResult {
    let started = Instant::now();
    match run_script(interpreter, code, args, Duration::from_secs(timeout_secs)).await {
        Ok(out) => out.into(),
        Err(e) => ScriptResult {
            stdout: String::new(),
            stderr: e.to_string(),
            retcode: 1,
            execution_time: started.elapsed().as_secs_f64(),
        },
    }
}

/// Fetch task `task_id`, run it, and PATCH the result back to the same route.
pub async fn run_task(ctx: &AgentContext, task_id: i64) -> Result<ScriptResult> {
    let path = taskrunner_path(task_id, ctx.agent_id());
    let task: AutomatedTask = ctx.controller.get_json(&path).await?;
    tracing::info!(task_id, shell = %task.script.shell, "running automated task");

    let result =
        run_script_result(&task.script.shell, &task.script.code, &task.args, task.timeout).await;
    ctx.controller.patch_json(&path, &result).await?;
    tracing::debug!(task_id, retcode = result.retcode, "task result reported");
    Ok(result)
}

/// Run every script check assigned to this agent and report each result.
/// Returns how many results were accepted by the controller.
pub async fn run_checks(ctx: &AgentContext) -> Result<usize> {
    let config: CheckRunnerConfig = ctx
        .controller
        .get_json(&checkrunner_path(ctx.agent_id()))
        .await?;
    tracing::info!(checks = config.checks.len(), "running checks");

    let runs = config.checks.iter().map(|check| async move {
        let result = run_script_result(
            &check.script.shell,
            &check.script.code,
            &check.script_args,
            check.timeout,
        )
        .await;
        let body = CheckResult {
            id: check.id,
            agent_id: ctx.agent_id(),
            result,
        };
        match ctx.controller.patch_json(CHECK_RESULTS_PATH, &body).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(check = check.id, error = %e, "could not report check result");
                false
            }
        }
    });
    let reported = futures_util::future::join_all(runs)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();
    Ok(reported)
}

/// Collect host facts (plus the public address) and push them.
pub async fn send_sysinfo(ctx: &AgentContext) -> Result<()> {
    let mut facts = ctx.host.system_facts().await?;
    if let (Some(obj), Ok(ip)) = (facts.as_object_mut(), ctx.host.public_ip().await) {
        obj.insert("public_ip".into(), serde_json::Value::String(ip));
    }
    ctx.controller
        .patch_json(&sysinfo_path(ctx.agent_id()), &facts)
        .await
}

pub async fn send_software(ctx: &AgentContext) -> Result<()> {
    let software = ctx.host.software().await?;
    ctx.controller
        .patch_json(
            &software_path(ctx.agent_id()),
            &serde_json::json!({ "software": software }),
        )
        .await
}

pub async fn sync_info(ctx: &AgentContext) -> Result<()> {
    send_sysinfo(ctx).await?;
    send_software(ctx).await
}
