//! Self-update, uninstall and reboot sequencing.
//!
//! Every sequence that ends the process replies first, flushes the
//! transport, and only then hands over to the exit hook.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use fleetagent_bus::Responder;
use fleetagent_schema::{Command, REPLY_OK, REPLY_UPDATE_RUNNING};
use semver::Version;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::{AgentContext, GuardName};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Called with the exit status once a terminating sequence has flushed.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

pub fn process_exit_hook() -> ExitHook {
    Arc::new(|code| std::process::exit(code))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    pub url: String,
    pub version: Version,
    pub sha256: Option<String>,
}

impl UpdateDescriptor {
    pub fn new(url: &str, version: &str, sha256: Option<&str>) -> Result<Self> {
        if url.is_empty() {
            bail!("update url is missing");
        }
        let version = Version::parse(version.trim_start_matches('v'))
            .with_context(|| format!("invalid update version: {version}"))?;
        Ok(Self {
            url: url.to_string(),
            version,
            sha256: sha256
                .filter(|s| !s.is_empty())
                .map(|s| s.to_ascii_lowercase()),
        })
    }

    pub fn from_command(cmd: &Command) -> Result<Self> {
        Self::new(
            cmd.arg("url").unwrap_or_default(),
            cmd.arg("version").unwrap_or_default(),
            cmd.arg("sha256"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Installed(Version),
}

pub struct LifecycleController {
    current_version: Version,
    staging_dir: PathBuf,
    http: reqwest::Client,
    exit: ExitHook,
    stopping: watch::Sender<bool>,
}

impl LifecycleController {
    pub fn new(current_version: Version, staging_dir: PathBuf, exit: ExitHook) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            current_version,
            staging_dir,
            http: reqwest::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .unwrap_or_default(),
            exit,
            stopping,
        }
    }

    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stopping.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Stop accepting commands; in-flight handlers keep running.
    pub fn begin_shutdown(&self) {
        self.stopping.send_replace(true);
    }

    fn terminate(&self, code: i32) {
        tracing::info!(code, "agent exiting");
        self.begin_shutdown();
        (self.exit)(code);
    }

    async fn flush(&self, ctx: &AgentContext) {
        if let Err(e) = ctx.transport.flush().await {
            tracing::warn!(error = %e, "transport flush failed before exit");
        }
    }

    /// Download, verify and swap in the binary described by `desc`.
    pub async fn self_update(&self, desc: &UpdateDescriptor) -> Result<UpdateOutcome> {
        if desc.version <= self.current_version {
            tracing::info!(
                current = %self.current_version,
                offered = %desc.version,
                "agent already up to date"
            );
            return Ok(UpdateOutcome::UpToDate);
        }

        tracing::info!(url = %desc.url, version = %desc.version, "downloading agent update");
        let bytes = self
            .http
            .get(&desc.url)
            .send()
            .await
            .with_context(|| format!("failed to download {}", desc.url))?
            .error_for_status()?
            .bytes()
            .await?;

        if let Some(expected) = &desc.sha256 {
            verify_checksum(&bytes, expected)?;
        }

        let staging_dir = self.staging_dir.clone();
        tokio::task::spawn_blocking(move || install_binary(&staging_dir, &bytes))
            .await
            .map_err(|e| anyhow!("update install aborted: {e}"))??;

        tracing::info!(version = %desc.version, "agent binary replaced");
        Ok(UpdateOutcome::Installed(desc.version.clone()))
    }

    /// Guarded self-update: reply, update, release the guard, flush, exit.
    ///
    /// The process exits whatever the outcome; the service manager restarts
    /// it from whichever binary is now in place.
    pub async fn run_self_update(
        &self,
        ctx: &AgentContext,
        cmd: &Command,
        reply: &Responder,
    ) -> Result<()> {
        let Some(permit) = ctx.guards.try_hold(GuardName::SelfUpdate) else {
            tracing::debug!("agent update already running");
            reply.send(REPLY_UPDATE_RUNNING).await?;
            return Ok(());
        };
        reply.send(REPLY_OK).await?;

        let outcome = match UpdateDescriptor::from_command(cmd) {
            Ok(desc) => self.self_update(&desc).await,
            Err(e) => Err(e),
        };
        permit.release();

        match outcome {
            Ok(UpdateOutcome::Installed(version)) => {
                tracing::info!(%version, "restarting into updated agent");
            }
            Ok(UpdateOutcome::UpToDate) => {}
            Err(e) => tracing::error!(error = %format!("{e:#}"), "agent update failed"),
        }
        self.flush(ctx).await;
        self.terminate(0);
        Ok(())
    }

    /// Reply, remove agent-owned state, flush, exit.
    pub async fn run_uninstall(&self, ctx: &AgentContext, reply: &Responder) -> Result<()> {
        if let Err(e) = reply.send(REPLY_OK).await {
            tracing::warn!(error = %e, "could not acknowledge uninstall");
        }

        let removed = ctx.tasks.cleanup_all_owned().await;
        tracing::info!(removed, "uninstalling agent");
        if let Err(e) = ctx.host.uninstall().await {
            tracing::warn!(error = %format!("{e:#}"), "host uninstall step failed");
        }

        self.flush(ctx).await;
        self.terminate(0);
        Ok(())
    }

    pub async fn run_reboot(&self, ctx: &AgentContext, reply: &Responder) -> Result<()> {
        reply.send(REPLY_OK).await?;
        self.flush(ctx).await;
        ctx.host.reboot().await
    }
}

fn verify_checksum(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = hex::encode(Sha256::digest(bytes));
    if actual != expected {
        bail!("checksum mismatch: expected {expected}, got {actual}");
    }
    Ok(())
}

fn install_binary(staging_dir: &std::path::Path, bytes: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(staging_dir)
        .with_context(|| format!("failed to create {}", staging_dir.display()))?;
    let mut staged = tempfile::Builder::new()
        .prefix("fleetagent-update-")
        .tempfile_in(staging_dir)
        .context("failed to stage update")?;
    staged.write_all(bytes)?;
    staged.flush()?;
    staged
        .as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    self_replace::self_replace(staged.path()).context("failed to replace agent binary")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> LifecycleController {
        LifecycleController::new(
            Version::new(1, 2, 0),
            std::env::temp_dir(),
            Arc::new(|_| {}),
        )
    }

    #[test]
    fn descriptor_requires_url_and_semver() {
        assert!(UpdateDescriptor::new("", "1.0.0", None).is_err());
        assert!(UpdateDescriptor::new("https://x/agent", "latest", None).is_err());

        let desc = UpdateDescriptor::new("https://x/agent", "v2.0.1", Some("ABCD")).unwrap();
        assert_eq!(desc.version, Version::new(2, 0, 1));
        assert_eq!(desc.sha256.as_deref(), Some("abcd"));
    }

    #[test]
    fn descriptor_reads_command_payload() {
        let cmd = Command::new("agent-self-update")
            .with_arg("url", "https://x/agent")
            .with_arg("version", "1.3.0")
            .with_arg("sha256", "");
        let desc = UpdateDescriptor::from_command(&cmd).unwrap();
        assert_eq!(desc.url, "https://x/agent");
        assert!(desc.sha256.is_none());
    }

    #[tokio::test]
    async fn same_or_older_version_is_a_noop() {
        let lc = controller();
        let desc = UpdateDescriptor::new("http://127.0.0.1:1/never", "1.2.0", None).unwrap();
        assert_eq!(lc.self_update(&desc).await.unwrap(), UpdateOutcome::UpToDate);
        let desc = UpdateDescriptor::new("http://127.0.0.1:1/never", "0.9.9", None).unwrap();
        assert_eq!(lc.self_update(&desc).await.unwrap(), UpdateOutcome::UpToDate);
    }

    #[test]
    fn checksum_is_compared_as_hex() {
        let digest = hex::encode(Sha256::digest(b"agent"));
        assert!(verify_checksum(b"agent", &digest).is_ok());
        assert!(verify_checksum(b"agent", "00").is_err());
    }

    #[test]
    fn shutdown_is_observable() {
        let lc = controller();
        let rx = lc.subscribe_stop();
        assert!(!lc.is_stopping());
        lc.begin_shutdown();
        assert!(*rx.borrow());
    }
}
