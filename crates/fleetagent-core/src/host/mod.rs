//! Host collaborators: inventory, services, packages and power control.
//!
//! Everything here is plain I/O behind [`HostOps`]; handlers own the
//! sequencing and the controller round trips.

mod linux;

pub use linux::LinuxHost;

use anyhow::Result;
use async_trait::async_trait;
use fleetagent_schema::{
    EventLogRecord, OsUpdateRecord, ServiceActionResult, ServiceDetail, ServiceRecord,
    SoftwareRecord,
};

/// Outcome of installing a package manager on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManagerStatus {
    pub name: String,
    pub installed: bool,
}

#[async_trait]
pub trait HostOps: Send + Sync {
    async fn event_log(&self, log_name: &str, days: u32) -> Result<Vec<EventLogRecord>>;

    async fn services(&self) -> Result<Vec<ServiceRecord>>;

    async fn service_detail(&self, name: &str) -> Result<ServiceDetail>;

    async fn service_action(&self, name: &str, action: &str) -> ServiceActionResult;

    async fn service_edit(&self, name: &str, start_type: &str) -> ServiceActionResult;

    async fn software(&self) -> Result<Vec<SoftwareRecord>>;

    async fn reboot(&self) -> Result<()>;

    async fn reboot_required(&self) -> Result<bool>;

    /// Share of CPU capacity in use, as a whole percentage.
    async fn cpu_load_average(&self) -> Result<u32>;

    async fn public_ip(&self) -> Result<String>;

    /// Hardware and OS facts, serialized as sent to the controller.
    async fn system_facts(&self) -> Result<serde_json::Value>;

    /// Whether another check-runner invocation is alive.
    async fn checks_running(&self) -> bool;

    async fn install_package_manager(&self) -> PackageManagerStatus;

    /// Install one package; returns the installer's output.
    async fn install_package(&self, name: &str) -> Result<String>;

    async fn os_updates(&self) -> Result<Vec<OsUpdateRecord>>;

    /// Install the given updates, or everything pending when `ids` is empty.
    async fn install_os_updates(&self, ids: &[String]) -> Result<String>;

    async fn restart_agent_service(&self) -> Result<()>;

    /// Host-side uninstall steps beyond scheduled-task cleanup.
    async fn uninstall(&self) -> Result<()>;
}
