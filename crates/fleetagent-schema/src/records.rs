use serde::{Deserialize, Serialize};

/// Structured reply of `script-run-full` and the body posted back for task runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptResult {
    pub stdout: String,
    pub stderr: String,
    pub retcode: i32,
    /// Wall-clock seconds.
    pub execution_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i32,
    pub ppid: i32,
    pub name: String,
    #[serde(default)]
    pub cmdline: String,
    #[serde(default)]
    pub username: String,
    pub membytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub display_name: String,
    pub status: String,
    pub start_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDetail {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub status: String,
    pub start_type: String,
    pub binpath: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceActionResult {
    pub success: bool,
    pub errormsg: String,
}

impl ServiceActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            errormsg: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            errormsg: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventLogRecord {
    pub time: String,
    pub level: String,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SoftwareRecord {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsUpdateRecord {
    pub id: String,
    pub title: String,
    pub version: String,
}
