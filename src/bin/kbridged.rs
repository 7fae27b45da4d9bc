//! kbridge daemon binary
//!
//! Provides commands to start, stop, and inspect the daemon, and to run the
//! bundled Python kernel.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use kbridge::daemon::{wait_for_listener, BridgeClient, BridgeConfig, BridgeServer, DaemonLauncher};
use kbridge::kernel::discovery::{self, Candidate};
use kbridge::kernel::{DiscoveryConnector, PYTHON_DRIVER};
use kbridge::{logging, BridgeError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::PathBuf;
use std::process::{self, Command};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kbridged")]
#[command(about = "Local bridge daemon between editors and running interpreters")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Start the daemon
    Start {
        #[command(flatten)]
        common: Common,

        /// Seconds without requests before exiting (0 = never)
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Detach and return once the daemon is accepting connections
        #[arg(long)]
        background: bool,
    },
    /// Check daemon status
    Status {
        #[command(flatten)]
        common: Common,
    },
    /// Stop the daemon
    Stop {
        #[command(flatten)]
        common: Common,
    },
    /// List advertised kernels and whether they are reachable
    Kernels {
        #[command(flatten)]
        common: Common,
    },
    /// Run the bundled Python kernel in the foreground
    Kernel {
        #[command(flatten)]
        common: Common,

        /// Python interpreter to run
        #[arg(long)]
        python: Option<String>,
    },
}

#[derive(Args, Debug)]
struct Common {
    /// TCP port on 127.0.0.1
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding kernel connection files
    #[arg(long)]
    connection_dir: Option<PathBuf>,
}

impl Common {
    fn config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::load();
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = &self.connection_dir {
            config.connection_dir = dir.clone();
        }
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Action::Start {
            common,
            idle_timeout,
            background,
        } => {
            let mut config = common.config();
            if let Some(secs) = idle_timeout {
                config.idle_timeout = Duration::from_secs(secs);
            }
            if background {
                start_background(&config)
            } else {
                start_daemon(&config)
            }
        }
        Action::Status { common } => check_status(&common.config()),
        Action::Stop { common } => stop_daemon(&common.config()),
        Action::Kernels { common } => list_kernels(&common.config()),
        Action::Kernel { common, python } => {
            let mut config = common.config();
            if let Some(python) = python {
                config.python = python;
            }
            run_kernel(&config)
        }
    }
}

fn start_daemon(config: &BridgeConfig) -> Result<()> {
    let connector = Arc::new(DiscoveryConnector::new(
        config.connection_dir.clone(),
        config.probe_timeout,
    ));

    let mut server = match BridgeServer::bind(config, connector) {
        Ok(server) => server,
        Err(BridgeError::AlreadyRunning(port)) => {
            // Another instance owns the port; nothing for the launcher to do
            info!(port, "daemon already running");
            return Ok(());
        }
        Err(e) => return Err(e).context("failed to bind daemon port"),
    };

    server
        .install_signal_handlers()
        .context("failed to install signal handlers")?;
    if let Err(e) = server.write_pid_file(config.pid_file(config.port)) {
        warn!(error = %e, "could not write PID file");
    }

    let reason = server.run().context("daemon accept loop failed")?;
    info!(reason = ?reason, "daemon stopped");

    // Removes the PID file; handler threads still running are abandoned
    drop(server);
    process::exit(0);
}

fn start_background(config: &BridgeConfig) -> Result<()> {
    let client = BridgeClient::new(config).without_spawn();
    if client.is_daemon_running() {
        println!("Daemon is already running on {}", client.addr());
        return Ok(());
    }

    let program = std::env::current_exe().context("cannot locate kbridged executable")?;
    DaemonLauncher::new(program, config.port)
        .idle_timeout(config.idle_timeout)
        .connection_dir(&config.connection_dir)
        .spawn()?;

    wait_for_listener(client.addr(), config.spawn_wait)
        .with_context(|| format!("daemon did not start listening on {}", client.addr()))?;

    println!("kbridge daemon started on {}", client.addr());
    Ok(())
}

fn read_pid(config: &BridgeConfig) -> Option<i32> {
    fs::read_to_string(config.pid_file(config.port))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn check_status(config: &BridgeConfig) -> Result<()> {
    let client = BridgeClient::new(config).without_spawn();

    if !client.is_daemon_running() {
        println!("Daemon is not running on {}.", client.addr());
        return Ok(());
    }

    println!("Daemon is running on {}", client.addr());
    if let Some(pid) = read_pid(config) {
        println!("PID: {}", pid);
    }
    Ok(())
}

fn stop_daemon(config: &BridgeConfig) -> Result<()> {
    let client = BridgeClient::new(config).without_spawn();
    let pid_path = config.pid_file(config.port);

    if !client.is_daemon_running() {
        println!("Daemon is not running on {}.", client.addr());
        let _ = fs::remove_file(&pid_path);
        return Ok(());
    }

    let pid = read_pid(config).ok_or_else(|| {
        anyhow!(
            "daemon is listening but {} is missing; stop it manually",
            pid_path.display()
        )
    })?;

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("failed to signal daemon (PID {})", pid))?;
    println!("Sent shutdown signal to daemon (PID {}).", pid);

    // Wait for the port to close (up to 5 seconds)
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
        if !client.is_daemon_running() {
            println!("Daemon stopped.");
            return Ok(());
        }
    }

    bail!("daemon (PID {}) is still listening after 5 seconds", pid)
}

fn list_kernels(config: &BridgeConfig) -> Result<()> {
    let candidates: Vec<Candidate> = match discovery::scan(&config.connection_dir, config.probe_timeout) {
        Ok(candidates) => candidates,
        Err(e) => {
            println!("{}", e);
            return Ok(());
        }
    };

    if candidates.is_empty() {
        println!("No connection files in {}.", config.connection_dir.display());
        return Ok(());
    }

    for candidate in candidates {
        println!(
            "{:<12} {}:{:<6} {}",
            if candidate.reachable { "reachable" } else { "unreachable" },
            candidate.info.ip,
            candidate.info.shell_port,
            candidate.path.display()
        );
    }
    Ok(())
}

fn run_kernel(config: &BridgeConfig) -> Result<()> {
    fs::create_dir_all(&config.connection_dir).with_context(|| {
        format!("cannot create {}", config.connection_dir.display())
    })?;

    info!(python = %config.python, dir = %config.connection_dir.display(), "starting Python kernel");
    let status = Command::new(&config.python)
        .arg("-c")
        .arg(PYTHON_DRIVER)
        .arg("--connection-dir")
        .arg(&config.connection_dir)
        .status()
        .with_context(|| format!("failed to run {}", config.python))?;

    process::exit(status.code().unwrap_or(1));
}
