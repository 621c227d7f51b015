pub mod commands;
pub mod records;

pub use records::*;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Literal reply for commands that only acknowledge receipt.
pub const REPLY_OK: &str = "ok";
/// Literal reply when a guarded operation is already in flight.
pub const REPLY_BUSY: &str = "busy";
/// Literal reply when a self-update is already running.
pub const REPLY_UPDATE_RUNNING: &str = "updaterunning";

/// One inbound unit of work, decoded from a transport message.
///
/// Field names follow the controller's wire format; the `alias` forms are
/// accepted so that hand-written envelopes (`{name: "ping"}`) decode too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    #[serde(rename = "func", alias = "name")]
    pub name: String,
    /// Timeout in seconds for commands that run a process. Zero means "use the handler default".
    #[serde(default)]
    pub timeout: u64,
    #[serde(default, rename = "payload")]
    pub data: HashMap<String, String>,
    #[serde(default)]
    pub script_args: Vec<String>,
    #[serde(default, rename = "proc_pid", alias = "pid")]
    pub pid: Option<i32>,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default, rename = "schedtaskpayload", alias = "task")]
    pub scheduled_task: Option<TaskPayload>,
    #[serde(default, rename = "recoverycommand")]
    pub recovery_command: Option<String>,
    #[serde(default, rename = "guids")]
    pub update_ids: Vec<String>,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub pending_action_pk: Option<i64>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: 0,
            data: HashMap::new(),
            script_args: Vec::new(),
            pid: None,
            task_id: None,
            scheduled_task: None,
            recovery_command: None,
            update_ids: Vec::new(),
            package_name: None,
            pending_action_pk: None,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Look up a string argument from the free-form payload map.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// The requested timeout, falling back to `default_secs` when unset.
    pub fn timeout_or(&self, default_secs: u64) -> u64 {
        if self.timeout == 0 {
            default_secs
        } else {
            self.timeout
        }
    }
}

/// Flat scheduled-task definition as the controller sends it.
///
/// This is validated into the tagged trigger/action model by the scheduler
/// crate before anything is registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPayload {
    #[serde(default)]
    pub pk: i64,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "deleteafter")]
    pub delete_after: bool,
    /// Day-of-week bitmask: Sunday = 1, Monday = 2, ... Saturday = 64.
    #[serde(default)]
    pub weekdays: u16,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub month: String,
    #[serde(default)]
    pub day: u32,
    #[serde(default)]
    pub hour: u32,
    #[serde(default, rename = "min")]
    pub minute: u32,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub run_asap_after_missed: bool,
}
