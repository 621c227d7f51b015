#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleetagent_bus::{codec, MemoryBus, Transport, TransportError};
use fleetagent_core::*;
use fleetagent_scheduler::{AgentBinary, SqliteFacility, TaskStore};
use fleetagent_schema::{
    EventLogRecord, OsUpdateRecord, ServiceActionResult, ServiceDetail, ServiceRecord,
    SoftwareRecord,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const AGENT_ID: &str = "agent-1";
pub const TOKEN: &str = "tok";

/// Host double that counts side effects instead of touching the machine.
pub struct FakeHost {
    pub reboots: AtomicUsize,
    pub restarts: AtomicUsize,
    pub uninstalls: AtomicUsize,
    pub checks_running: AtomicBool,
    /// `os_updates` waits for a permit here.
    pub scan_gate: Semaphore,
    pub installed_packages: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reboots: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            uninstalls: AtomicUsize::new(0),
            checks_running: AtomicBool::new(false),
            scan_gate: Semaphore::new(Semaphore::MAX_PERMITS),
            installed_packages: Mutex::new(Vec::new()),
        })
    }

    pub fn gated() -> Arc<Self> {
        let host = Self::new();
        host.scan_gate.forget_permits(Semaphore::MAX_PERMITS);
        host
    }
}

#[async_trait]
impl HostOps for FakeHost {
    async fn event_log(&self, log_name: &str, days: u32) -> anyhow::Result<Vec<EventLogRecord>> {
        Ok(vec![EventLogRecord {
            time: "2026-10-19T10:00:00+00:00".into(),
            level: "INFO".into(),
            source: log_name.into(),
            message: format!("last {days} days"),
        }])
    }

    async fn services(&self) -> anyhow::Result<Vec<ServiceRecord>> {
        Ok(vec![ServiceRecord {
            name: "cron".into(),
            display_name: "Cron".into(),
            status: "running".into(),
            start_type: "automatic".into(),
        }])
    }

    async fn service_detail(&self, name: &str) -> anyhow::Result<ServiceDetail> {
        if name != "cron" {
            anyhow::bail!("unit {name} not found");
        }
        Ok(ServiceDetail {
            name: "cron".into(),
            display_name: "Cron".into(),
            description: "Cron".into(),
            status: "running".into(),
            start_type: "automatic".into(),
            binpath: "/usr/sbin/cron -f".into(),
            pid: 812,
        })
    }

    async fn service_action(&self, _name: &str, action: &str) -> ServiceActionResult {
        if action == "stop" {
            ServiceActionResult::ok()
        } else {
            ServiceActionResult::failed(format!("unknown service action: {action}"))
        }
    }

    async fn service_edit(&self, _name: &str, _start_type: &str) -> ServiceActionResult {
        ServiceActionResult::ok()
    }

    async fn software(&self) -> anyhow::Result<Vec<SoftwareRecord>> {
        Ok(vec![SoftwareRecord {
            name: "bash".into(),
            version: "5.1".into(),
            publisher: "GNU".into(),
            size: 1024,
        }])
    }

    async fn reboot(&self) -> anyhow::Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reboot_required(&self) -> anyhow::Result<bool> {
        anyhow::bail!("probe unavailable")
    }

    async fn cpu_load_average(&self) -> anyhow::Result<u32> {
        Ok(42)
    }

    async fn public_ip(&self) -> anyhow::Result<String> {
        Ok("203.0.113.7".into())
    }

    async fn system_facts(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({ "hostname": "web-01" }))
    }

    async fn checks_running(&self) -> bool {
        self.checks_running.load(Ordering::SeqCst)
    }

    async fn install_package_manager(&self) -> PackageManagerStatus {
        PackageManagerStatus {
            name: "apt".into(),
            installed: true,
        }
    }

    async fn install_package(&self, name: &str) -> anyhow::Result<String> {
        self.installed_packages.lock().unwrap().push(name.to_string());
        Ok(format!("{name} installed"))
    }

    async fn os_updates(&self) -> anyhow::Result<Vec<OsUpdateRecord>> {
        if let Ok(permit) = self.scan_gate.acquire().await {
            permit.forget();
        }
        Ok(vec![OsUpdateRecord {
            id: "bash".into(),
            title: "bash 5.1-6ubuntu1.1".into(),
            version: "5.1-6ubuntu1.1".into(),
        }])
    }

    async fn install_os_updates(&self, ids: &[String]) -> anyhow::Result<String> {
        Ok(format!("upgraded {}", ids.join(" ")))
    }

    async fn restart_agent_service(&self) -> anyhow::Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn uninstall(&self) -> anyhow::Result<()> {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub bus: Arc<MemoryBus>,
    pub ctx: Arc<AgentContext>,
    pub host: Arc<FakeHost>,
    pub exits: Arc<Mutex<Vec<i32>>>,
    _tmp: TempDir,
}

pub fn config(controller_url: &str, data_dir: PathBuf) -> AgentConfig {
    AgentConfig {
        agent_id: AGENT_ID.into(),
        controller_url: controller_url.into(),
        token: TOKEN.into(),
        nats_url: "nats://127.0.0.1:4222".into(),
        root_cert: None,
        data_dir: data_dir.clone(),
        log_dir: data_dir,
        task_prefix: "FleetAgent_".into(),
        service_name: "fleetagent".into(),
        uninstall_command: None,
    }
}

/// Build a context over a fresh in-memory bus and task store, and start a
/// dispatcher on the agent subject.
pub async fn harness(host: Arc<FakeHost>, controller_url: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new(64));
    let facility = SqliteFacility::open_in_memory().unwrap();
    let tasks = TaskStore::new(Arc::new(facility), "FleetAgent_");

    let exits = Arc::new(Mutex::new(Vec::new()));
    let recorded = exits.clone();
    let lifecycle = LifecycleController::new(
        semver::Version::new(1, 0, 0),
        tmp.path().to_path_buf(),
        Arc::new(move |code| recorded.lock().unwrap().push(code)),
    );

    let ctx = Arc::new(AgentContext {
        config: config(controller_url, tmp.path().to_path_buf()),
        transport: bus.clone(),
        guards: GuardSet::new(),
        tasks,
        host: host.clone(),
        controller: ControllerClient::new(controller_url, TOKEN),
        lifecycle,
        agent: AgentBinary::new("/bin/false", tmp.path().join("agent.yaml")),
    });

    let dispatcher = Dispatcher::new(ctx.clone(), default_registry());
    let subscription = bus.subscribe(AGENT_ID).await.unwrap();
    tokio::spawn(async move { dispatcher.run(subscription).await });

    Harness {
        bus,
        ctx,
        host,
        exits,
        _tmp: tmp,
    }
}

impl Harness {
    pub async fn request_raw<T: Serialize + ?Sized>(
        &self,
        body: &T,
        wait: Duration,
    ) -> Result<Bytes, TransportError> {
        let payload = Bytes::from(codec::encode(body).unwrap());
        self.bus.request(AGENT_ID, payload, wait).await
    }

    pub async fn request<T: Serialize + ?Sized, R: DeserializeOwned>(&self, body: &T) -> R {
        let reply = self
            .request_raw(body, Duration::from_secs(5))
            .await
            .expect("no reply");
        codec::decode(&reply).unwrap()
    }

    /// Publish without a reply subject.
    pub async fn send<T: Serialize + ?Sized>(&self, body: &T) {
        let payload = Bytes::from(codec::encode(body).unwrap());
        self.bus.publish(AGENT_ID, payload).await.unwrap();
    }

    pub fn exits(&self) -> Vec<i32> {
        self.exits.lock().unwrap().clone()
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
