//! Command discriminants understood by the agent.

pub const PING: &str = "ping";

pub const TASK_ADD: &str = "task-add";
pub const TASK_DELETE: &str = "task-delete";
pub const TASK_ENABLE: &str = "task-enable";
pub const TASK_LIST: &str = "task-list";
pub const TASK_RUN: &str = "task-run";

pub const EVENTLOG_QUERY: &str = "eventlog-query";
pub const PROCESS_LIST: &str = "process-list";
pub const PROCESS_KILL: &str = "process-kill";
pub const RUN_RAW_COMMAND: &str = "run-raw-command";

pub const SERVICE_LIST: &str = "service-list";
pub const SERVICE_DETAIL: &str = "service-detail";
pub const SERVICE_ACTION: &str = "service-action";
pub const SERVICE_EDIT: &str = "service-edit";

pub const SCRIPT_RUN: &str = "script-run";
pub const SCRIPT_RUN_FULL: &str = "script-run-full";

pub const RECOVER_AGENT: &str = "recover-agent";
pub const RECOVERY_COMMAND: &str = "recoverycmd";
pub const SOFTWARE_LIST: &str = "software-list";
pub const REBOOT_NOW: &str = "reboot-now";
pub const REBOOT_NEEDED_CHECK: &str = "reboot-needed-check";
pub const SYSTEM_INFO_REFRESH: &str = "system-info-refresh";
pub const SYNC_INFO: &str = "sync-info";
pub const CPU_LOAD_AVERAGE: &str = "cpu-load-average";
pub const RUN_CHECKS: &str = "run-checks";
pub const PUBLIC_IP: &str = "public-ip";

pub const INSTALL_PACKAGE_MANAGER: &str = "install-package-manager";
pub const INSTALL_PACKAGE: &str = "install-package";
pub const GET_OS_UPDATES: &str = "get-os-updates";
pub const INSTALL_OS_UPDATES: &str = "install-os-updates";

pub const AGENT_SELF_UPDATE: &str = "agent-self-update";
pub const AGENT_UNINSTALL: &str = "agent-uninstall";
