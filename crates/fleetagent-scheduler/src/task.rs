use std::path::{Path, PathBuf};

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use fleetagent_schema::TaskPayload;
use serde::{Deserialize, Serialize};

use crate::TaskError;

/// A delete-after-run once trigger stops being eligible this many minutes after its start.
pub const ONCE_EXPIRY_MINUTES: i64 = 10;
/// Expired delete-after-run tasks are reclaimed this many minutes after their end boundary.
pub const DELETE_EXPIRED_AFTER_MINUTES: i64 = 15;

/// Start boundary used for manual tasks: far enough in the past that it never fires on its own.
pub fn manual_start_boundary() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1975, 1, 1)
        .and_then(|d| d.and_hms_opt(1, 0, 0))
        .unwrap_or_default()
}

/// Day-of-week bitmask: Sunday = 1, Monday = 2, ... Saturday = 64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const ALL: Weekdays = Weekdays(0x7f);

    pub fn from_bits(bits: u16) -> Self {
        Self((bits & 0x7f) as u8)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Once {
        start: NaiveDateTime,
        /// Set for delete-after-run tasks.
        end: Option<NaiveDateTime>,
    },
    Weekly {
        days: Weekdays,
        /// First eligible firing; its time of day is the weekly firing time.
        start: NaiveDateTime,
    },
    Manual,
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Once { .. } => "once",
            Trigger::Weekly { .. } => "weekly",
            Trigger::Manual => "manual",
        }
    }

    pub fn start_boundary(&self) -> NaiveDateTime {
        match self {
            Trigger::Once { start, .. } | Trigger::Weekly { start, .. } => *start,
            Trigger::Manual => manual_start_boundary(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    /// Runs a controller-defined automated task through the agent binary.
    AgentInternal { pk: i64 },
    Reboot,
    Custom {
        path: String,
        workdir: String,
        args: String,
    },
}

/// Concrete process invocation for a task action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
}

/// The running agent binary and the config file it was started with.
/// Child agent processes get the same `--config` as their parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBinary {
    pub exe: PathBuf,
    pub config: PathBuf,
}

impl AgentBinary {
    pub fn new(exe: impl Into<PathBuf>, config: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            config: config.into(),
        }
    }

    /// Invocation of one agent subcommand, e.g. `["run-checks"]`.
    pub fn invocation(&self, subcommand: &[&str]) -> Invocation {
        let mut args = vec!["--config".to_string(), self.config.display().to_string()];
        args.extend(subcommand.iter().map(|a| a.to_string()));
        Invocation {
            program: self.exe.display().to_string(),
            args,
            workdir: self.exe.parent().map(Path::to_path_buf),
        }
    }
}

impl TaskAction {
    pub fn invocation(&self, agent: &AgentBinary) -> Invocation {
        match self {
            TaskAction::AgentInternal { pk } => {
                agent.invocation(&["task-run", "--id", &pk.to_string()])
            }
            TaskAction::Reboot => Invocation {
                program: "shutdown".into(),
                args: vec!["-r".into(), "+0".into()],
                workdir: None,
            },
            TaskAction::Custom {
                path,
                workdir,
                args,
            } => Invocation {
                program: path.clone(),
                args: args.split_whitespace().map(str::to_string).collect(),
                workdir: (!workdir.is_empty()).then(|| PathBuf::from(workdir)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub action: TaskAction,
    pub trigger: Trigger,
    pub enabled: bool,
    pub delete_after: bool,
    pub parallel: bool,
    pub run_asap_after_missed: bool,
}

impl ScheduledTask {
    /// When the facility may reclaim this task without further instruction.
    pub fn reclaim_at(&self) -> Option<NaiveDateTime> {
        match (&self.trigger, self.delete_after) {
            (Trigger::Once { end: Some(end), .. }, true) => {
                Some(*end + Duration::minutes(DELETE_EXPIRED_AFTER_MINUTES))
            }
            _ => None,
        }
    }

    /// Validate a controller payload, resolving weekly start times against `now`.
    pub fn from_payload(payload: &TaskPayload, now: NaiveDateTime) -> Result<Self, TaskError> {
        if payload.name.trim().is_empty() {
            return Err(TaskError::InvalidAction("task name is empty".into()));
        }

        let trigger = match payload.trigger.as_str() {
            "once" => {
                let start = wall_clock(payload)?;
                let end = payload
                    .delete_after
                    .then(|| start + Duration::minutes(ONCE_EXPIRY_MINUTES));
                Trigger::Once { start, end }
            }
            "weekly" => {
                let days = Weekdays::from_bits(payload.weekdays);
                if days.is_empty() {
                    return Err(TaskError::InvalidTrigger(
                        "weekly trigger needs at least one weekday".into(),
                    ));
                }
                let time = time_of_day(payload)?;
                Trigger::Weekly {
                    days,
                    start: now.date().and_time(time),
                }
            }
            "manual" => Trigger::Manual,
            "" => return Err(TaskError::InvalidTrigger("trigger is missing".into())),
            other => {
                return Err(TaskError::InvalidTrigger(format!(
                    "unknown trigger kind: {other}"
                )))
            }
        };

        let action = match payload.kind.as_str() {
            "rmm" | "agent-internal" => TaskAction::AgentInternal { pk: payload.pk },
            "schedreboot" | "reboot" => TaskAction::Reboot,
            "custom" => {
                if payload.path.trim().is_empty() {
                    return Err(TaskError::InvalidAction(
                        "custom task needs a path".into(),
                    ));
                }
                TaskAction::Custom {
                    path: payload.path.clone(),
                    workdir: payload.workdir.clone(),
                    args: payload.args.clone(),
                }
            }
            other => {
                return Err(TaskError::InvalidAction(format!(
                    "unknown task type: {other:?}"
                )))
            }
        };

        Ok(Self {
            name: payload.name.clone(),
            action,
            trigger,
            enabled: payload.enabled,
            delete_after: payload.delete_after,
            parallel: payload.parallel,
            run_asap_after_missed: payload.run_asap_after_missed,
        })
    }
}

impl TryFrom<&TaskPayload> for ScheduledTask {
    type Error = TaskError;

    fn try_from(payload: &TaskPayload) -> Result<Self, Self::Error> {
        Self::from_payload(payload, Local::now().naive_local())
    }
}

/// English month name to month number; unrecognised names mean January.
pub fn month_number(name: &str) -> u32 {
    const MONTHS: [&str; 12] = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    let name = name.trim().to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == name)
        .map(|idx| idx as u32 + 1)
        .unwrap_or(1)
}

fn time_of_day(payload: &TaskPayload) -> Result<NaiveTime, TaskError> {
    NaiveTime::from_hms_opt(payload.hour, payload.minute, 0).ok_or_else(|| {
        TaskError::InvalidTrigger(format!(
            "invalid time of day {:02}:{:02}",
            payload.hour, payload.minute
        ))
    })
}

fn wall_clock(payload: &TaskPayload) -> Result<NaiveDateTime, TaskError> {
    let month = month_number(&payload.month);
    let date = NaiveDate::from_ymd_opt(payload.year, month, payload.day).ok_or_else(|| {
        TaskError::InvalidTrigger(format!(
            "invalid date {}-{:02}-{:02}",
            payload.year, month, payload.day
        ))
    })?;
    Ok(date.and_time(time_of_day(payload)?))
}
