use std::{fs, path::Path, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleetagent/agent.yaml";

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetagent")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/fleetagent")
}

fn default_task_prefix() -> String {
    "FleetAgent_".to_string()
}

fn default_service_name() -> String {
    "fleetagent".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent identity; also the inbound subject and the transport user.
    pub agent_id: String,
    pub controller_url: String,
    pub token: String,
    pub nats_url: String,
    #[serde(default)]
    pub root_cert: Option<PathBuf>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_task_prefix")]
    pub task_prefix: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub uninstall_command: Option<String>,
}

impl AgentConfig {
    pub fn tasks_db_path(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }

    /// Human-readable summary with the token masked.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("agent_id:        {}", self.agent_id),
            format!("controller_url:  {}", self.controller_url),
            format!("nats_url:        {}", self.nats_url),
            format!("token:           {}", mask(&self.token)),
            format!("data_dir:        {}", self.data_dir.display()),
            format!("log_dir:         {}", self.log_dir.display()),
            format!("task_prefix:     {}", self.task_prefix),
            format!("service_name:    {}", self.service_name),
        ];
        if let Some(cert) = &self.root_cert {
            lines.push(format!("root_cert:       {}", cert.display()));
        }
        if let Some(cmd) = &self.uninstall_command {
            lines.push(format!("uninstall:       {cmd}"));
        }
        lines.join("\n")
    }
}

fn mask(secret: &str) -> String {
    match secret.len() {
        0 => "(empty)".to_string(),
        n if n <= 4 => "****".to_string(),
        _ => format!("{}****", &secret[..4]),
    }
}

/// Expand `${VAR}` references from the environment; unset variables become empty.
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: AgentConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))?;

    config.token = resolve_env_var(&config.token);
    config.controller_url = resolve_env_var(&config.controller_url);
    config.nats_url = resolve_env_var(&config.nats_url);

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &AgentConfig) -> Result<()> {
    if config.agent_id.trim().is_empty() {
        return Err(anyhow!("agent_id must not be empty"));
    }
    if config.agent_id.contains(['.', '*', '>', ' ']) {
        return Err(anyhow!(
            "agent_id is not a valid subject token: {}",
            config.agent_id
        ));
    }
    if !config.controller_url.starts_with("http://") && !config.controller_url.starts_with("https://")
    {
        return Err(anyhow!(
            "controller_url must be an http(s) url: {}",
            config.controller_url
        ));
    }
    if config.nats_url.trim().is_empty() {
        return Err(anyhow!("nats_url must not be empty"));
    }
    if config.task_prefix.is_empty() {
        return Err(anyhow!("task_prefix must not be empty"));
    }
    Ok(())
}
