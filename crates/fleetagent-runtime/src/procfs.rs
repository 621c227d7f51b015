//! Process table read from `/proc`.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use fleetagent_schema::ProcessRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StatusFields {
    name: String,
    state: char,
    ppid: i32,
    uid: Option<u32>,
    rss_kb: u64,
}

fn parse_status(text: &str) -> StatusFields {
    let mut fields = StatusFields::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Name" => fields.name = value.to_string(),
            "State" => fields.state = value.chars().next().unwrap_or('?'),
            "PPid" => fields.ppid = value.parse().unwrap_or(0),
            "Uid" => {
                fields.uid = value
                    .split_whitespace()
                    .next()
                    .and_then(|uid| uid.parse().ok())
            }
            "VmRSS" => {
                fields.rss_kb = value
                    .split_whitespace()
                    .next()
                    .and_then(|kb| kb.parse().ok())
                    .unwrap_or(0)
            }
            _ => {}
        }
    }
    fields
}

fn read_status(pid: i32) -> Option<StatusFields> {
    fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .map(|text| parse_status(&text))
}

fn read_cmdline(pid: i32) -> String {
    fs::read(format!("/proc/{pid}/cmdline"))
        .map(|raw| {
            raw.split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn numeric_entries() -> io::Result<Vec<i32>> {
    Ok(fs::read_dir("/proc")?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect())
}

fn usernames() -> HashMap<u32, String> {
    let Ok(passwd) = fs::read_to_string("/etc/passwd") else {
        return HashMap::new();
    };
    passwd
        .lines()
        .filter_map(|line| {
            let mut parts = line.split(':');
            let name = parts.next()?;
            let uid = parts.nth(1)?.parse().ok()?;
            Some((uid, name.to_string()))
        })
        .collect()
}

/// Whether `pid` names a live (non-zombie) process.
pub fn is_alive(pid: i32) -> bool {
    if !Path::new(&format!("/proc/{pid}")).exists() {
        return false;
    }
    read_status(pid).is_some_and(|status| status.state != 'Z')
}

/// Direct children of `pid`.
pub fn children_of(pid: i32) -> Vec<i32> {
    numeric_entries()
        .unwrap_or_default()
        .into_iter()
        .filter(|&candidate| read_status(candidate).is_some_and(|s| s.ppid == pid))
        .collect()
}

/// Snapshot of every process visible to the agent. Processes that exit mid-scan are skipped.
pub fn list_processes() -> io::Result<Vec<ProcessRecord>> {
    let users = usernames();
    let mut records: Vec<ProcessRecord> = numeric_entries()?
        .into_iter()
        .filter_map(|pid| {
            let status = read_status(pid)?;
            Some(ProcessRecord {
                pid,
                ppid: status.ppid,
                cmdline: read_cmdline(pid),
                username: status
                    .uid
                    .and_then(|uid| users.get(&uid).cloned())
                    .unwrap_or_default(),
                membytes: status.rss_kb * 1024,
                name: status.name,
            })
        })
        .collect();
    records.sort_by_key(|r| r.pid);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tsleep\nUmask:\t0022\nState:\tS (sleeping)\nTgid:\t4242\nPid:\t4242\nPPid:\t1000\nUid:\t1001\t1001\t1001\t1001\nVmRSS:\t    1832 kB\n";

    #[test]
    fn parses_status_fields() {
        let fields = parse_status(STATUS);
        assert_eq!(fields.name, "sleep");
        assert_eq!(fields.state, 'S');
        assert_eq!(fields.ppid, 1000);
        assert_eq!(fields.uid, Some(1001));
        assert_eq!(fields.rss_kb, 1832);
    }

    #[test]
    fn kernel_threads_have_no_rss() {
        let fields = parse_status("Name:\tkthreadd\nState:\tS (sleeping)\nPPid:\t0\n");
        assert_eq!(fields.rss_kb, 0);
        assert_eq!(fields.ppid, 0);
    }

    #[test]
    fn lists_current_process() {
        let me = std::process::id() as i32;
        let procs = list_processes().unwrap();
        let entry = procs.iter().find(|p| p.pid == me).unwrap();
        assert!(!entry.name.is_empty());
        assert!(is_alive(me));
    }

    #[test]
    fn finds_spawned_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let me = std::process::id() as i32;
        let children = children_of(me);
        assert!(children.contains(&(child.id() as i32)));
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
