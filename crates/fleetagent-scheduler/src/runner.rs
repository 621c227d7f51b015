use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use fleetagent_runtime::{run_command, RunOptions};

use crate::{compute, AgentBinary, Firing, RunRecord, RunStatus, ScheduledTask, TaskStore};

/// Hard ceiling on a single scheduled run.
pub const EXECUTION_CEILING: Duration = Duration::from_secs(72 * 60 * 60);

const MAX_SLEEP_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl LaunchOutcome {
    pub fn ok(exit_code: i32) -> Self {
        Self {
            status: RunStatus::Ok,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    pub fn failed(exit_code: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            exit_code,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait TaskLauncher: Send + Sync {
    async fn launch(&self, task: &ScheduledTask) -> LaunchOutcome;
}

/// Launches task actions as real processes through the supervisor.
pub struct ProcessLauncher {
    agent: AgentBinary,
}

impl ProcessLauncher {
    pub fn new(agent: AgentBinary) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl TaskLauncher for ProcessLauncher {
    async fn launch(&self, task: &ScheduledTask) -> LaunchOutcome {
        let invocation = task.action.invocation(&self.agent);
        let opts = RunOptions {
            workdir: invocation.workdir,
            env: Vec::new(),
        };
        match run_command(&invocation.program, &invocation.args, EXECUTION_CEILING, &opts).await {
            Ok(out) if out.success() => LaunchOutcome::ok(out.exit_code),
            Ok(out) if out.timed_out => LaunchOutcome::failed(Some(out.exit_code), out.stderr),
            Ok(out) => LaunchOutcome::failed(
                Some(out.exit_code),
                format!("exited with code {}", out.exit_code),
            ),
            Err(e) => LaunchOutcome::failed(None, e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub launched: Vec<String>,
    pub skipped: Vec<String>,
    pub missed: Vec<String>,
    pub reclaimed: Vec<String>,
}

type RunningCounts = Arc<Mutex<HashMap<String, u32>>>;

/// Counts one in-flight run of a task for as long as it is alive.
struct RunningSlot {
    counts: RunningCounts,
    name: String,
}

impl RunningSlot {
    fn acquire(counts: &RunningCounts, name: &str) -> Self {
        if let Ok(mut map) = counts.lock() {
            *map.entry(name.to_string()).or_default() += 1;
        }
        Self {
            counts: counts.clone(),
            name: name.to_string(),
        }
    }
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        if let Ok(mut map) = self.counts.lock() {
            if let Some(count) = map.get_mut(&self.name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    map.remove(&self.name);
                }
            }
        }
    }
}

/// Fires due scheduled tasks and reclaims expired ones.
#[derive(Clone)]
pub struct TaskRunner {
    store: TaskStore,
    launcher: Arc<dyn TaskLauncher>,
    running: RunningCounts,
}

impl TaskRunner {
    pub fn new(store: TaskStore, launcher: Arc<dyn TaskLauncher>) -> Self {
        Self {
            store,
            launcher,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(&self) {
        let changed = self.store.changed();
        loop {
            let sleep_ms = self.compute_sleep_ms(now()).await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                    self.tick(now()).await;
                }
                _ = changed.notified() => {}
            }
        }
    }

    pub fn running_count(&self, name: &str) -> u32 {
        self.running
            .lock()
            .map(|map| map.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    async fn compute_sleep_ms(&self, now: NaiveDateTime) -> u64 {
        let Ok(entries) = self.store.entries().await else {
            return MAX_SLEEP_MS;
        };
        let soonest = entries
            .iter()
            .flat_map(|entry| {
                let next = entry
                    .state
                    .next_run_at
                    .filter(|_| entry.task.enabled);
                [next, entry.task.reclaim_at()]
            })
            .flatten()
            .min();

        match soonest {
            Some(at) => ((at - now).num_milliseconds().max(0) as u64).min(MAX_SLEEP_MS),
            None => MAX_SLEEP_MS,
        }
    }

    /// Evaluate every registered task against `now`.
    pub async fn tick(&self, now: NaiveDateTime) -> TickReport {
        let mut report = TickReport::default();
        let entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "task runner could not load tasks");
                return report;
            }
        };

        for entry in entries {
            let name = entry.task.name.clone();

            if entry.task.reclaim_at().is_some_and(|at| at <= now) {
                match self.store.delete(&name).await {
                    Ok(()) => report.reclaimed.push(name),
                    Err(e) => tracing::debug!(task = %name, error = %e, "could not reclaim task"),
                }
                continue;
            }

            let firing = compute::evaluate(
                &entry.task,
                entry.state.next_run_at,
                self.running_count(&name),
                now,
            );
            if firing == Firing::NotDue {
                continue;
            }

            let next = compute::next_fire_after(&entry.task.trigger, now);
            let fired_at = (firing == Firing::Run).then_some(now);
            if let Err(e) = self.store.set_schedule(&name, fired_at, next).await {
                tracing::warn!(task = %name, error = %e, "could not advance task schedule");
                continue;
            }

            match firing {
                Firing::Run => {
                    tracing::info!(task = %name, next_run_at = ?next, "firing scheduled task");
                    self.spawn_run(entry.task, now);
                    report.launched.push(name);
                }
                Firing::SkipRunning => {
                    tracing::debug!(task = %name, "previous run still active, skipping");
                    let record = RunRecord {
                        task_name: name.clone(),
                        started_at: now,
                        duration_ms: 0,
                        status: RunStatus::Skipped,
                        exit_code: None,
                        error: Some("previous instance still running".into()),
                    };
                    if let Err(e) = self.store.record_result(record).await {
                        tracing::warn!(task = %name, error = %e, "could not record skipped run");
                    }
                    report.skipped.push(name);
                }
                Firing::Missed => {
                    tracing::info!(task = %name, next_run_at = ?next, "missed scheduled run");
                    report.missed.push(name);
                }
                Firing::NotDue => {}
            }
        }

        report
    }

    fn spawn_run(&self, task: ScheduledTask, started_at: NaiveDateTime) {
        let slot = RunningSlot::acquire(&self.running, &task.name);
        let launcher = self.launcher.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let clock = Instant::now();
            let outcome = launcher.launch(&task).await;
            drop(slot);

            let duration_ms = clock.elapsed().as_millis() as u64;
            match outcome.status {
                RunStatus::Ok => tracing::info!(task = %task.name, duration_ms, "scheduled task finished"),
                _ => tracing::warn!(
                    task = %task.name,
                    duration_ms,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "scheduled task failed"
                ),
            }
            let record = RunRecord {
                task_name: task.name.clone(),
                started_at,
                duration_ms,
                status: outcome.status,
                exit_code: outcome.exit_code,
                error: outcome.error,
            };
            if let Err(e) = store.record_result(record).await {
                tracing::debug!(task = %task.name, error = %e, "could not record run result");
            }
        });
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
