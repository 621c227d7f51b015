//! The command table: one handler per discriminant in
//! [`fleetagent_schema::commands`].

mod lifecycle;
mod packages;
mod process;
mod system;
mod tasks;

use std::sync::Arc;

use anyhow::Result;
use fleetagent_bus::Responder;
use fleetagent_schema::{commands, Command};

use crate::{AgentContext, HandlerRegistry};

pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register(commands::PING, ping);

    registry.register(commands::TASK_ADD, tasks::add);
    registry.register(commands::TASK_DELETE, tasks::delete);
    registry.register(commands::TASK_ENABLE, tasks::enable);
    registry.register(commands::TASK_LIST, tasks::list);
    registry.register(commands::TASK_RUN, system::task_run);

    registry.register(commands::EVENTLOG_QUERY, system::eventlog_query);
    registry.register(commands::PROCESS_LIST, process::list);
    registry.register(commands::PROCESS_KILL, process::kill);
    registry.register(commands::RUN_RAW_COMMAND, process::run_raw_command);

    registry.register(commands::SERVICE_LIST, system::service_list);
    registry.register(commands::SERVICE_DETAIL, system::service_detail);
    registry.register(commands::SERVICE_ACTION, system::service_action);
    registry.register(commands::SERVICE_EDIT, system::service_edit);

    registry.register(commands::SCRIPT_RUN, process::script_run);
    registry.register(commands::SCRIPT_RUN_FULL, process::script_run_full);

    registry.register(commands::RECOVER_AGENT, system::recover_agent);
    registry.register(commands::RECOVERY_COMMAND, process::recovery_command);
    registry.register(commands::SOFTWARE_LIST, system::software_list);
    registry.register(commands::REBOOT_NOW, lifecycle::reboot_now);
    registry.register(commands::REBOOT_NEEDED_CHECK, system::reboot_needed_check);
    registry.register(commands::SYSTEM_INFO_REFRESH, system::system_info_refresh);
    registry.register(commands::SYNC_INFO, system::sync_info);
    registry.register(commands::CPU_LOAD_AVERAGE, system::cpu_load_average);
    registry.register(commands::RUN_CHECKS, system::run_checks);
    registry.register(commands::PUBLIC_IP, system::public_ip);

    registry.register(commands::INSTALL_PACKAGE_MANAGER, packages::install_package_manager);
    registry.register(commands::INSTALL_PACKAGE, packages::install_package);
    registry.register(commands::GET_OS_UPDATES, packages::get_os_updates);
    registry.register(commands::INSTALL_OS_UPDATES, packages::install_os_updates);

    registry.register(commands::AGENT_SELF_UPDATE, lifecycle::self_update);
    registry.register(commands::AGENT_UNINSTALL, lifecycle::uninstall);

    registry
}

async fn ping(_ctx: Arc<AgentContext>, _cmd: Command, reply: Responder) -> Result<()> {
    reply.send("pong").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_discriminant_has_a_handler() {
        let registry = default_registry();
        for name in [
            commands::PING,
            commands::TASK_ADD,
            commands::TASK_DELETE,
            commands::TASK_ENABLE,
            commands::TASK_LIST,
            commands::TASK_RUN,
            commands::EVENTLOG_QUERY,
            commands::PROCESS_LIST,
            commands::PROCESS_KILL,
            commands::RUN_RAW_COMMAND,
            commands::SERVICE_LIST,
            commands::SERVICE_DETAIL,
            commands::SERVICE_ACTION,
            commands::SERVICE_EDIT,
            commands::SCRIPT_RUN,
            commands::SCRIPT_RUN_FULL,
            commands::RECOVER_AGENT,
            commands::RECOVERY_COMMAND,
            commands::SOFTWARE_LIST,
            commands::REBOOT_NOW,
            commands::REBOOT_NEEDED_CHECK,
            commands::SYSTEM_INFO_REFRESH,
            commands::SYNC_INFO,
            commands::CPU_LOAD_AVERAGE,
            commands::RUN_CHECKS,
            commands::PUBLIC_IP,
            commands::INSTALL_PACKAGE_MANAGER,
            commands::INSTALL_PACKAGE,
            commands::GET_OS_UPDATES,
            commands::INSTALL_OS_UPDATES,
            commands::AGENT_SELF_UPDATE,
            commands::AGENT_UNINSTALL,
        ] {
            assert!(registry.contains(name), "missing handler for {name}");
        }
        assert_eq!(registry.len(), 32);
        assert!(!registry.contains("wmi"));
    }
}
