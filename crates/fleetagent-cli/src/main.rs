use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use semver::Version;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fleetagent_bus::{MemoryBus, NatsOptions, NatsTransport, Transport};
use fleetagent_core::*;
use fleetagent_scheduler::{AgentBinary, ProcessLauncher, SqliteFacility, TaskRunner, TaskStore};

#[derive(Parser)]
#[command(name = "fleetagent", version, about = "fleetagent remote management agent")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, help = "Path to the agent config file")]
    config: PathBuf,

    #[arg(long, default_value = "info", help = "Log filter when RUST_LOG is unset")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogTarget::File, help = "Where logs are written")]
    log_to: LogTarget,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogTarget {
    File,
    Stdout,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Connect to the message bus and serve commands")]
    Run,
    #[command(about = "Run a controller-defined task and report its result")]
    TaskRun {
        #[arg(long, help = "Task id on the controller")]
        id: i64,
    },
    #[command(about = "Run assigned script checks and report results")]
    RunChecks,
    #[command(about = "Push system facts and software inventory")]
    Sync,
    #[command(about = "Push system facts")]
    Sysinfo,
    #[command(about = "Push software inventory")]
    Software,
    #[command(about = "Print the public IP address")]
    PublicIp,
    #[command(about = "Delete all agent-owned scheduled tasks")]
    Cleanup,
    #[command(about = "Download and install a newer agent binary")]
    Update {
        #[arg(long, help = "Download URL of the new binary")]
        url: String,
        #[arg(long, help = "Version of the new binary")]
        version: String,
        #[arg(long, help = "Expected SHA-256 of the download (hex)")]
        sha256: Option<String>,
    },
    #[command(about = "Validate the config file")]
    Validate,
    #[command(about = "Print the agent version")]
    Version,
}

fn agent_version() -> Result<Version> {
    Version::parse(env!("CARGO_PKG_VERSION")).context("invalid package version")
}

/// Install the subscriber. The returned guard must outlive the program.
fn init_logging(
    level: &str,
    target: LogTarget,
    log_dir: &Path,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    if target == LogTarget::Stdout || std::fs::create_dir_all(log_dir).is_err() {
        registry.init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "fleetagent.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    registry
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Some(guard)
}

fn open_tasks(config: &AgentConfig) -> Result<TaskStore> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir: {}", config.data_dir.display()))?;
    let facility = SqliteFacility::open(&config.tasks_db_path())?;
    Ok(TaskStore::new(Arc::new(facility), config.task_prefix.clone()))
}

fn build_context(
    config: AgentConfig,
    config_path: &Path,
    transport: Arc<dyn Transport>,
    exit: ExitHook,
) -> Result<AgentContext> {
    let agent_exe = std::env::current_exe().context("cannot locate agent executable")?;
    let config_path = std::path::absolute(config_path)
        .with_context(|| format!("cannot resolve config path: {}", config_path.display()))?;
    let agent = AgentBinary::new(agent_exe, config_path);
    let tasks = open_tasks(&config)?;
    let host = Arc::new(LinuxHost::new(&config, agent.exe.clone()));
    let controller = ControllerClient::new(config.controller_url.clone(), config.token.clone());
    let lifecycle = LifecycleController::new(agent_version()?, config.data_dir.clone(), exit);
    Ok(AgentContext {
        config,
        transport,
        guards: GuardSet::new(),
        tasks,
        host,
        controller,
        lifecycle,
        agent,
    })
}

/// Context for one-shot modes, which never touch the message bus.
fn local_context(config: AgentConfig, config_path: &Path) -> Result<AgentContext> {
    build_context(config, config_path, Arc::new(MemoryBus::new(1)), process_exit_hook())
}

async fn run_service(config: AgentConfig, config_path: &Path) -> Result<()> {
    let options = NatsOptions {
        url: config.nats_url.clone(),
        name: format!("fleetagent-{}", config.agent_id),
        user: Some(config.agent_id.clone()),
        password: Some(config.token.clone()),
        root_cert: config.root_cert.clone(),
    };
    let transport = match NatsTransport::connect(options).await {
        Ok(t) => Arc::new(t),
        Err(e) => {
            tracing::error!(error = %e, "cannot connect to message bus");
            std::process::exit(1);
        }
    };

    let subject = config.agent_id.clone();
    let ctx = Arc::new(build_context(config, config_path, transport.clone(), process_exit_hook())?);
    let subscription = transport
        .subscribe(&subject)
        .await
        .with_context(|| format!("failed to subscribe to {subject}"))?;

    let runner = TaskRunner::new(
        ctx.tasks.clone(),
        Arc::new(ProcessLauncher::new(ctx.agent.clone())),
    );
    tokio::spawn(async move { runner.run().await });

    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            shutdown.lifecycle.begin_shutdown();
        }
    });

    tracing::info!(agent_id = %subject, version = %ctx.lifecycle.current_version(), "agent started");
    Dispatcher::new(ctx, default_registry()).run(subscription).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("fleetagent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let _guard = init_logging(&cli.log_level, cli.log_to, &config.log_dir);

    match cli.command {
        Commands::Version => {}
        Commands::Validate => {
            println!("Config valid.\n{}", config.summary());
        }
        Commands::Run => run_service(config, &cli.config).await?,
        Commands::TaskRun { id } => {
            let ctx = local_context(config, &cli.config)?;
            let result = jobs::run_task(&ctx, id).await?;
            tracing::info!(task_id = id, retcode = result.retcode, "task run complete");
        }
        Commands::RunChecks => {
            let ctx = local_context(config, &cli.config)?;
            let reported = jobs::run_checks(&ctx).await?;
            tracing::info!(reported, "check run complete");
        }
        Commands::Sync => jobs::sync_info(&local_context(config, &cli.config)?).await?,
        Commands::Sysinfo => jobs::send_sysinfo(&local_context(config, &cli.config)?).await?,
        Commands::Software => jobs::send_software(&local_context(config, &cli.config)?).await?,
        Commands::PublicIp => {
            let ctx = local_context(config, &cli.config)?;
            println!("{}", ctx.host.public_ip().await?);
        }
        Commands::Cleanup => {
            let tasks = open_tasks(&config)?;
            let removed = tasks.cleanup_all_owned().await;
            println!("Removed {removed} scheduled tasks.");
        }
        Commands::Update {
            url,
            version,
            sha256,
        } => {
            let ctx = local_context(config, &cli.config)?;
            let desc = UpdateDescriptor::new(&url, &version, sha256.as_deref())?;
            match ctx.lifecycle.self_update(&desc).await? {
                UpdateOutcome::UpToDate => println!("Already up to date."),
                UpdateOutcome::Installed(v) => println!("Updated to {v}."),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_defaults() {
        let cli = Cli::try_parse_from(["fleetagent", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_to, LogTarget::File);
    }

    #[test]
    fn parses_task_run_id() {
        let cli = Cli::try_parse_from(["fleetagent", "task-run", "--id", "12"]).unwrap();
        assert!(matches!(cli.command, Commands::TaskRun { id: 12 }));
    }

    #[test]
    fn task_run_requires_id() {
        assert!(Cli::try_parse_from(["fleetagent", "task-run"]).is_err());
    }

    #[test]
    fn parses_global_flags() {
        let cli = Cli::try_parse_from([
            "fleetagent",
            "--config",
            "/tmp/agent.yaml",
            "--log-to",
            "stdout",
            "--log-level",
            "debug",
            "validate",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/agent.yaml"));
        assert_eq!(cli.log_to, LogTarget::Stdout);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn parses_update_with_optional_checksum() {
        let cli = Cli::try_parse_from([
            "fleetagent",
            "update",
            "--url",
            "https://example.com/fleetagent",
            "--version",
            "1.4.0",
        ])
        .unwrap();
        match cli.command {
            Commands::Update { url, version, sha256 } => {
                assert_eq!(url, "https://example.com/fleetagent");
                assert_eq!(version, "1.4.0");
                assert!(sha256.is_none());
            }
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn rejects_unknown_log_target() {
        assert!(Cli::try_parse_from(["fleetagent", "--log-to", "syslog", "run"]).is_err());
    }

    #[test]
    fn one_shot_subcommands_parse() {
        for name in ["run-checks", "sync", "sysinfo", "software", "public-ip", "cleanup", "version"] {
            assert!(Cli::try_parse_from(["fleetagent", name]).is_ok(), "{name}");
        }
    }

    #[test]
    fn package_version_is_semver() {
        assert!(agent_version().is_ok());
    }
}
