use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use fleetagent_schema::TaskPayload;
use tokio::sync::Notify;

use crate::{
    compute, FacilitySession, RegisteredTask, RunRecord, ScheduledTask, TaskError, TaskFacility,
    Trigger,
};

/// Agent-facing scheduled task operations.
///
/// Every call opens one facility session on the blocking pool and drops it
/// before returning, so handlers never block the async runtime.
#[derive(Clone)]
pub struct TaskStore {
    facility: Arc<dyn TaskFacility>,
    prefix: String,
    changed: Arc<Notify>,
}

impl TaskStore {
    pub fn new(facility: Arc<dyn TaskFacility>, prefix: impl Into<String>) -> Self {
        Self {
            facility,
            prefix: prefix.into(),
            changed: Arc::new(Notify::new()),
        }
    }

    /// The reserved name prefix marking agent-owned tasks.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    async fn with_session<T, F>(&self, op: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn FacilitySession) -> Result<T, TaskError> + Send + 'static,
    {
        let facility = self.facility.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = facility.connect()?;
            op(session.as_mut())
        })
        .await
        .map_err(|e| TaskError::Facility(format!("facility call aborted: {e}")))?
    }

    pub async fn create(&self, task: ScheduledTask) -> Result<bool, TaskError> {
        let next = compute::initial_fire(&task.trigger, now());
        let name = task.name.clone();
        self.with_session(move |s| s.insert(&task, next)).await?;
        tracing::info!(task = %name, next_run_at = ?next, "scheduled task created");
        self.changed.notify_one();
        Ok(true)
    }

    pub async fn create_from_payload(&self, payload: &TaskPayload) -> Result<bool, TaskError> {
        let task = ScheduledTask::try_from(payload)?;
        self.create(task).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), TaskError> {
        let owned = name.to_string();
        self.with_session(move |s| s.remove(&owned)).await?;
        tracing::info!(task = %name, "scheduled task deleted");
        Ok(())
    }

    /// Flip the enabled flag, keeping trigger and action as registered.
    pub async fn enable(&self, name: &str, enabled: bool) -> Result<(), TaskError> {
        let owned = name.to_string();
        let now = now();
        self.with_session(move |s| {
            let entry = s
                .get(&owned)?
                .ok_or_else(|| TaskError::NotFound(owned.clone()))?;
            let next = if !enabled {
                entry.state.next_run_at
            } else {
                match entry.task.trigger {
                    Trigger::Once { .. } if entry.state.last_run_at.is_some() => None,
                    ref trigger => compute::initial_fire(trigger, now),
                }
            };
            s.set_enabled(&owned, enabled, next)
        })
        .await?;
        tracing::info!(task = %name, enabled, "scheduled task updated");
        self.changed.notify_one();
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Option<RegisteredTask>, TaskError> {
        let owned = name.to_string();
        self.with_session(move |s| s.get(&owned)).await
    }

    pub async fn entries(&self) -> Result<Vec<RegisteredTask>, TaskError> {
        self.with_session(|s| s.all()).await
    }

    /// Names of all registered tasks. Enumeration failures yield an empty list.
    pub async fn list(&self) -> Vec<String> {
        match self.entries().await {
            Ok(entries) => entries.into_iter().map(|e| e.task.name).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not enumerate scheduled tasks");
                Vec::new()
            }
        }
    }

    /// Delete every task carrying the reserved prefix. Per-task failures are skipped.
    pub async fn cleanup_all_owned(&self) -> usize {
        let prefix = self.prefix.clone();
        let result = self
            .with_session(move |s| {
                let mut removed = 0;
                for entry in s.all()? {
                    let name = entry.task.name;
                    if !name.starts_with(&prefix) {
                        continue;
                    }
                    match s.remove(&name) {
                        Ok(()) => removed += 1,
                        Err(e) => tracing::debug!(task = %name, error = %e, "cleanup skipped task"),
                    }
                }
                Ok(removed)
            })
            .await;
        match result {
            Ok(removed) => {
                tracing::info!(removed, "removed agent-owned scheduled tasks");
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, "scheduled task cleanup failed");
                0
            }
        }
    }

    pub async fn history(&self, name: &str, limit: usize) -> Result<Vec<RunRecord>, TaskError> {
        let owned = name.to_string();
        self.with_session(move |s| s.history(&owned, limit)).await
    }

    pub(crate) async fn set_schedule(
        &self,
        name: &str,
        last_run_at: Option<NaiveDateTime>,
        next_run_at: Option<NaiveDateTime>,
    ) -> Result<(), TaskError> {
        let owned = name.to_string();
        self.with_session(move |s| s.set_schedule(&owned, last_run_at, next_run_at))
            .await
    }

    pub(crate) async fn record_result(&self, record: RunRecord) -> Result<(), TaskError> {
        self.with_session(move |s| s.record_result(&record)).await
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
