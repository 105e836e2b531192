//! Hive daemon entry point.
//!
//! Runs the event bus in the foreground or detached, and controls a running
//! instance of it through its PID file.

use std::path::{Path, PathBuf};
use std::process::{Command as Process, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hive_daemon::{DaemonConfig, PluginCatalog, is_listening, pidfile};
use tokio::time::sleep;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(100);

/// Hive daemon - event bus for connected instances
#[derive(Parser, Debug)]
#[command(name = "hive-daemon")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to `~/.config/hive/config.json`)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Socket path (defaults to `$XDG_RUNTIME_DIR/hive.sock`)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// PID file path
    #[arg(long, global = true, value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Plugin to load; repeat to load several (replaces the configured list)
    #[arg(long = "plugin", global = true, value_name = "NAME")]
    plugins: Vec<String>,

    /// Exit once the last instance disconnects
    #[arg(long, global = true)]
    auto_close: bool,

    /// Echo every line received from instances
    #[arg(long, global = true)]
    print_events: bool,

    /// Start in the background
    #[arg(long, global = true)]
    daemon: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Start the daemon
    Start,

    /// Stop the running daemon
    Stop,

    /// Stop, then start the daemon
    Restart,

    /// List the plugins that would be loaded
    List,
}

impl Cli {
    /// Config file values with command-line flags applied on top.
    fn daemon_config(&self) -> Result<DaemonConfig> {
        let mut config = match self.config.clone().or_else(DaemonConfig::default_path) {
            Some(path) => DaemonConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => DaemonConfig::default(),
        };

        if let Some(socket) = &self.socket {
            config.socket_path.clone_from(socket);
        }
        if let Some(pid_file) = &self.pid_file {
            config.pid_file = Some(pid_file.clone());
        }
        if !self.plugins.is_empty() {
            config.plugins.clone_from(&self.plugins);
        }
        config.auto_close |= self.auto_close;
        config.print_events |= self.print_events;
        Ok(config)
    }
}

/// Install the tracing subscriber. The returned guard flushes the log file
/// and must live until exit.
fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hive={default_level}")));

    let Some(log_file) = log_file else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Invalid log file path {}", log_file.display()))?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .with(filter)
        .init();

    Ok(Some(guard))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.verbose, cli.log_file.as_deref())?;
    let config = cli.daemon_config()?;

    match cli.command {
        Command::Start => start(config, cli.daemon).await,
        Command::Stop => stop(&config).await,
        Command::Restart => {
            stop(&config).await?;
            start(config, cli.daemon).await
        }
        Command::List => list(&config).await,
    }
}

async fn start(config: DaemonConfig, detach: bool) -> Result<()> {
    if detach {
        return start_background(&config.socket_path).await;
    }

    info!("Starting hive daemon...");
    hive_daemon::run(config, &PluginCatalog::builtin())
        .await
        .context("Daemon failed")?;
    info!("Hive daemon stopped");
    Ok(())
}

/// Re-run this binary in the foreground mode with stdio detached, then wait
/// for it to accept connections.
async fn start_background(socket: &Path) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Failed to locate the daemon binary")?;
    let args = std::env::args_os().skip(1).filter(|arg| arg != "--daemon");

    let child = Process::new(&exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", exe.display()))?;

    let started = Instant::now();
    while started.elapsed() < STARTUP_TIMEOUT {
        if is_listening(socket).await {
            println!("Daemon started (pid {})", child.id());
            return Ok(());
        }
        sleep(WAIT_STEP).await;
    }

    bail!("Daemon failed to start within {} seconds", STARTUP_TIMEOUT.as_secs())
}

async fn stop(config: &DaemonConfig) -> Result<()> {
    let Some(pid_file) = config.pid_file.as_deref() else {
        println!("No PID file configured, cannot locate the daemon");
        return Ok(());
    };
    let Some(pid) = pidfile::read(pid_file) else {
        println!("Daemon not running (no PID file at {})", pid_file.display());
        return Ok(());
    };
    if !pidfile::is_alive(pid) {
        println!("Daemon not running (stale PID {pid})");
        pidfile::remove(pid_file);
        return Ok(());
    }

    pidfile::terminate(pid).with_context(|| format!("Failed to signal daemon (pid {pid})"))?;

    let started = Instant::now();
    while started.elapsed() < STOP_TIMEOUT {
        if !pidfile::is_alive(pid) {
            println!("Daemon stopped");
            return Ok(());
        }
        sleep(WAIT_STEP).await;
    }

    bail!(
        "Daemon (pid {pid}) did not exit within {} seconds",
        STOP_TIMEOUT.as_secs()
    )
}

async fn list(config: &DaemonConfig) -> Result<()> {
    let catalog = PluginCatalog::builtin();

    println!("Plugins (load order):");
    for name in &config.plugins {
        if catalog.contains(name) {
            println!("  {name}");
        } else {
            println!("  {name} (unknown)");
        }
    }

    println!();
    if is_listening(&config.socket_path).await {
        println!("Daemon running on {}", config.socket_path.display());
    } else {
        println!("Daemon not running");
    }
    Ok(())
}
