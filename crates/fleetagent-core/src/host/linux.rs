use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetagent_runtime::{list_processes, run_command, run_raw, ExecOutput, RunOptions};
use fleetagent_schema::{
    EventLogRecord, OsUpdateRecord, ServiceActionResult, ServiceDetail, ServiceRecord,
    SoftwareRecord,
};

use super::{HostOps, PackageManagerStatus};
use crate::AgentConfig;

const HOST_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(1200);
const EVENT_LOG_LIMIT: &str = "5000";
const PUBLIC_IP_ENDPOINTS: [&str; 2] = ["https://api.ipify.org", "https://icanhazip.com"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageManager {
    Apt,
    Dnf,
}

impl PackageManager {
    fn detect() -> Option<Self> {
        if Path::new("/usr/bin/apt-get").exists() {
            Some(Self::Apt)
        } else if Path::new("/usr/bin/dnf").exists() {
            Some(Self::Dnf)
        } else {
            None
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
        }
    }
}

/// systemd/journald/dpkg-or-rpm host.
pub struct LinuxHost {
    service_name: String,
    uninstall_command: Option<String>,
    agent_exe: PathBuf,
    http: reqwest::Client,
}

impl LinuxHost {
    pub fn new(config: &AgentConfig, agent_exe: PathBuf) -> Self {
        Self {
            service_name: config.service_name.clone(),
            uninstall_command: config.uninstall_command.clone(),
            agent_exe,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn package_manager(&self) -> Result<PackageManager> {
        PackageManager::detect().ok_or_else(|| anyhow!("no supported package manager found"))
    }
}

async fn exec(program: &str, args: &[&str], timeout: Duration) -> Result<ExecOutput> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let opts = RunOptions {
        workdir: None,
        env: vec![("DEBIAN_FRONTEND".into(), "noninteractive".into())],
    };
    Ok(run_command(program, &args, timeout, &opts).await?)
}

async fn capture(program: &str, args: &[&str]) -> Result<String> {
    let out = exec(program, args, HOST_COMMAND_TIMEOUT).await?;
    if !out.success() {
        bail!(
            "{program} exited with code {}: {}",
            out.exit_code,
            out.stderr.trim()
        );
    }
    Ok(out.stdout)
}

async fn systemctl_result(args: &[&str]) -> ServiceActionResult {
    match capture("systemctl", args).await {
        Ok(_) => ServiceActionResult::ok(),
        Err(e) => ServiceActionResult::failed(e.to_string()),
    }
}

#[async_trait]
impl HostOps for LinuxHost {
    async fn event_log(&self, log_name: &str, days: u32) -> Result<Vec<EventLogRecord>> {
        let since = format!("{} days ago", days.max(1));
        let mut args = vec![
            "--since",
            since.as_str(),
            "-o",
            "json",
            "--no-pager",
            "-q",
            "-n",
            EVENT_LOG_LIMIT,
        ];
        if !log_name.is_empty() && !log_name.eq_ignore_ascii_case("system") {
            args.extend(["-u", log_name]);
        }
        let out = capture("journalctl", &args).await?;
        Ok(parse_journal(&out))
    }

    async fn services(&self) -> Result<Vec<ServiceRecord>> {
        let units = capture(
            "systemctl",
            &[
                "list-units",
                "--type=service",
                "--all",
                "--no-legend",
                "--no-pager",
                "--plain",
            ],
        )
        .await?;
        let files = capture(
            "systemctl",
            &["list-unit-files", "--type=service", "--no-legend", "--no-pager"],
        )
        .await
        .unwrap_or_default();
        Ok(parse_services(&units, &files))
    }

    async fn service_detail(&self, name: &str) -> Result<ServiceDetail> {
        let out = capture(
            "systemctl",
            &[
                "show",
                name,
                "--no-pager",
                "--property=Id,Description,ActiveState,SubState,UnitFileState,ExecStart,MainPID",
            ],
        )
        .await?;
        Ok(parse_service_detail(name, &out))
    }

    async fn service_action(&self, name: &str, action: &str) -> ServiceActionResult {
        match action {
            "start" | "stop" | "restart" => systemctl_result(&[action, name]).await,
            other => ServiceActionResult::failed(format!("unknown service action: {other}")),
        }
    }

    async fn service_edit(&self, name: &str, start_type: &str) -> ServiceActionResult {
        match start_type {
            "auto" | "automatic" | "autodelay" => systemctl_result(&["enable", name]).await,
            "manual" | "disabled" => systemctl_result(&["disable", name]).await,
            other => ServiceActionResult::failed(format!("unknown start type: {other}")),
        }
    }

    async fn software(&self) -> Result<Vec<SoftwareRecord>> {
        if Path::new("/usr/bin/dpkg-query").exists() {
            let out = capture(
                "dpkg-query",
                &[
                    "-W",
                    "-f",
                    "${Package}\t${Version}\t${Maintainer}\t${Installed-Size}\n",
                ],
            )
            .await?;
            return Ok(parse_software(&out, 1024));
        }
        let out = capture(
            "rpm",
            &[
                "-qa",
                "--queryformat",
                "%{NAME}\t%{VERSION}-%{RELEASE}\t%{VENDOR}\t%{SIZE}\n",
            ],
        )
        .await?;
        Ok(parse_software(&out, 1))
    }

    async fn reboot(&self) -> Result<()> {
        tracing::warn!("rebooting host");
        capture("shutdown", &["-r", "+0"]).await?;
        Ok(())
    }

    async fn reboot_required(&self) -> Result<bool> {
        if Path::new("/var/run/reboot-required").exists() {
            return Ok(true);
        }
        if Path::new("/usr/bin/needs-restarting").exists() {
            let out = exec("needs-restarting", &["-r"], HOST_COMMAND_TIMEOUT).await?;
            return Ok(out.exit_code == 1);
        }
        Ok(false)
    }

    async fn cpu_load_average(&self) -> Result<u32> {
        let raw = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .context("failed to read /proc/loadavg")?;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        load_percent(&raw, cpus)
    }

    async fn public_ip(&self) -> Result<String> {
        let mut last_err = anyhow!("no public ip endpoint configured");
        for endpoint in PUBLIC_IP_ENDPOINTS {
            let body = match self.http.get(endpoint).send().await {
                Ok(resp) if resp.status().is_success() => resp.text().await,
                Ok(resp) => {
                    last_err = anyhow!("{endpoint} returned {}", resp.status());
                    continue;
                }
                Err(e) => {
                    last_err = e.into();
                    continue;
                }
            };
            match body.map(|b| b.trim().parse::<IpAddr>()) {
                Ok(Ok(ip)) => return Ok(ip.to_string()),
                Ok(Err(e)) => last_err = anyhow!("{endpoint} returned a non-ip body: {e}"),
                Err(e) => last_err = e.into(),
            }
        }
        Err(last_err)
    }

    async fn system_facts(&self) -> Result<serde_json::Value> {
        let read = |path: &'static str| async move {
            tokio::fs::read_to_string(path)
                .await
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };
        let os_release = read("/etc/os-release").await;
        let meminfo = read("/proc/meminfo").await;
        let cpuinfo = read("/proc/cpuinfo").await;
        let uptime = read("/proc/uptime").await;

        Ok(serde_json::json!({
            "hostname": read("/proc/sys/kernel/hostname").await,
            "os": os_pretty_name(&os_release),
            "kernel": read("/proc/sys/kernel/osrelease").await,
            "arch": std::env::consts::ARCH,
            "cpu_model": key_value(&cpuinfo, "model name", ':').unwrap_or_default(),
            "cpu_count": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            "total_ram_kb": key_value(&meminfo, "MemTotal", ':')
                .and_then(|v| v.trim_end_matches("kB").trim().parse::<u64>().ok())
                .unwrap_or(0),
            "uptime_secs": uptime
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0) as u64,
            "agent_version": env!("CARGO_PKG_VERSION"),
        }))
    }

    async fn checks_running(&self) -> bool {
        let exe_name = self
            .agent_exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let me = std::process::id() as i32;
        match tokio::task::spawn_blocking(list_processes).await {
            Ok(Ok(procs)) => procs.iter().any(|p| {
                p.pid != me && p.cmdline.contains(&exe_name) && p.cmdline.contains("run-checks")
            }),
            _ => false,
        }
    }

    async fn install_package_manager(&self) -> PackageManagerStatus {
        match PackageManager::detect() {
            Some(pm) => PackageManagerStatus {
                name: pm.name().to_string(),
                installed: true,
            },
            None => PackageManagerStatus {
                name: String::new(),
                installed: false,
            },
        }
    }

    async fn install_package(&self, name: &str) -> Result<String> {
        check_package_name(name)?;
        let out = match self.package_manager()? {
            PackageManager::Apt => exec("apt-get", &["install", "-y", name], INSTALL_TIMEOUT).await?,
            PackageManager::Dnf => exec("dnf", &["install", "-y", name], INSTALL_TIMEOUT).await?,
        };
        if out.stderr.trim().is_empty() {
            Ok(out.stdout)
        } else {
            Ok(out.stderr)
        }
    }

    async fn os_updates(&self) -> Result<Vec<OsUpdateRecord>> {
        match self.package_manager()? {
            PackageManager::Apt => {
                let out = capture("apt", &["list", "--upgradable"]).await?;
                Ok(parse_apt_upgradable(&out))
            }
            PackageManager::Dnf => {
                let out = exec("dnf", &["check-update", "-q"], INSTALL_TIMEOUT).await?;
                // 100 means "updates available"
                if out.exit_code != 0 && out.exit_code != 100 {
                    bail!("dnf check-update failed: {}", out.stderr.trim());
                }
                Ok(parse_dnf_check_update(&out.stdout))
            }
        }
    }

    async fn install_os_updates(&self, ids: &[String]) -> Result<String> {
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        for id in &ids {
            check_package_name(id)?;
        }
        let (program, mut args) = match self.package_manager()? {
            PackageManager::Apt if ids.is_empty() => ("apt-get", vec!["upgrade", "-y"]),
            PackageManager::Apt => ("apt-get", vec!["install", "--only-upgrade", "-y"]),
            PackageManager::Dnf => ("dnf", vec!["upgrade", "-y"]),
        };
        args.extend(ids);
        let out = exec(program, &args, INSTALL_TIMEOUT).await?;
        if !out.success() {
            bail!("{program} exited with code {}: {}", out.exit_code, out.stderr.trim());
        }
        Ok(out.combined())
    }

    async fn restart_agent_service(&self) -> Result<()> {
        capture("systemctl", &["--no-block", "restart", &self.service_name]).await?;
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        match &self.uninstall_command {
            Some(cmd) => {
                let out = run_raw("sh", cmd, Duration::from_secs(300)).await?;
                if !out.success() {
                    bail!("uninstall command failed: {}", out.combined().trim());
                }
            }
            None => {
                capture("systemctl", &["disable", &self.service_name]).await?;
            }
        }
        Ok(())
    }
}

/// Package names go to apt-get/dnf as positional arguments and must not
/// parse as options.
fn check_package_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("package name is empty");
    }
    if name.starts_with('-') {
        bail!("invalid package name: {name}");
    }
    Ok(())
}

fn priority_name(priority: &str) -> &'static str {
    match priority {
        "0" | "1" | "2" => "CRITICAL",
        "3" => "ERROR",
        "4" => "WARNING",
        "7" => "DEBUG",
        _ => "INFO",
    }
}

fn parse_journal(out: &str) -> Vec<EventLogRecord> {
    out.lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|entry| {
            let message = entry.get("MESSAGE")?.as_str()?.to_string();
            let time = entry
                .get("__REALTIME_TIMESTAMP")
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(DateTime::<Utc>::from_timestamp_micros)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            let source = entry
                .get("SYSLOG_IDENTIFIER")
                .or_else(|| entry.get("_COMM"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let level = priority_name(
                entry
                    .get("PRIORITY")
                    .and_then(|v| v.as_str())
                    .unwrap_or("6"),
            );
            Some(EventLogRecord {
                time,
                level: level.to_string(),
                source,
                message,
            })
        })
        .collect()
}

fn start_type_of(state: &str) -> &'static str {
    match state {
        "enabled" | "enabled-runtime" => "automatic",
        "disabled" | "masked" => "disabled",
        _ => "manual",
    }
}

fn parse_services(units: &str, unit_files: &str) -> Vec<ServiceRecord> {
    let start_types: std::collections::HashMap<&str, &str> = unit_files
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            Some((cols.next()?, cols.next()?))
        })
        .collect();

    units
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let unit = cols.next()?;
            let _load = cols.next()?;
            let _active = cols.next()?;
            let sub = cols.next()?;
            let description = cols.collect::<Vec<_>>().join(" ");
            let name = unit.trim_end_matches(".service").to_string();
            Some(ServiceRecord {
                display_name: if description.is_empty() {
                    name.clone()
                } else {
                    description
                },
                status: if sub == "running" { "running" } else { "stopped" }.to_string(),
                start_type: start_type_of(start_types.get(unit).copied().unwrap_or("")).to_string(),
                name,
            })
        })
        .collect()
}

fn key_value<'a>(text: &'a str, key: &str, sep: char) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once(sep)?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn parse_service_detail(name: &str, out: &str) -> ServiceDetail {
    let get = |key: &str| key_value(out, key, '=').unwrap_or_default().to_string();
    let exec_start = get("ExecStart");
    let binpath = exec_start
        .split_once("argv[]=")
        .map(|(_, rest)| rest.split(" ;").next().unwrap_or(rest).trim().to_string())
        .unwrap_or_default();
    let description = get("Description");
    ServiceDetail {
        name: name.trim_end_matches(".service").to_string(),
        display_name: description.clone(),
        description,
        status: if get("SubState") == "running" {
            "running"
        } else {
            "stopped"
        }
        .to_string(),
        start_type: start_type_of(&get("UnitFileState")).to_string(),
        binpath,
        pid: get("MainPID").parse().unwrap_or(0),
    }
}

fn parse_software(out: &str, size_unit: u64) -> Vec<SoftwareRecord> {
    out.lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let name = cols.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(SoftwareRecord {
                name: name.to_string(),
                version: cols.next().unwrap_or_default().to_string(),
                publisher: cols.next().unwrap_or_default().to_string(),
                size: cols
                    .next()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .unwrap_or(0)
                    * size_unit,
            })
        })
        .collect()
}

fn parse_apt_upgradable(out: &str) -> Vec<OsUpdateRecord> {
    out.lines()
        .filter(|line| line.contains('/'))
        .filter_map(|line| {
            let (name, rest) = line.split_once('/')?;
            let version = rest.split_whitespace().nth(1)?;
            Some(OsUpdateRecord {
                id: name.to_string(),
                title: format!("{name} {version}"),
                version: version.to_string(),
            })
        })
        .collect()
}

fn parse_dnf_check_update(out: &str) -> Vec<OsUpdateRecord> {
    out.lines()
        .take_while(|line| !line.starts_with("Obsoleting"))
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let version = cols.next()?;
            cols.next()?;
            Some(OsUpdateRecord {
                id: name.to_string(),
                title: format!("{name} {version}"),
                version: version.to_string(),
            })
        })
        .collect()
}

fn os_pretty_name(os_release: &str) -> String {
    key_value(os_release, "PRETTY_NAME", '=')
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_else(|| "Linux".to_string())
}

fn load_percent(loadavg: &str, cpus: usize) -> Result<u32> {
    let one_minute: f64 = loadavg
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("empty /proc/loadavg"))?
        .parse()
        .context("malformed /proc/loadavg")?;
    let percent = one_minute / cpus.max(1) as f64 * 100.0;
    Ok(percent.round().clamp(0.0, 100.0) as u32)
}
