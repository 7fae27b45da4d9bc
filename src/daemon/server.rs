use crate::daemon::config::BridgeConfig;
use crate::daemon::connection::Connection;
use crate::daemon::protocol::MessageType;
use crate::error::{BridgeError, Result};
use crate::kernel::{aggregate, strip_leading_comment, ExecutionResult, KernelConnector};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::fs;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long the accept loop sleeps when no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Back-off after an unexpected accept error
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// =============================================================================
// IdleClock - time of the most recent request
// =============================================================================

/// Shared `last_request_at` timestamp
///
/// Stored as milliseconds since daemon start so that handlers can update it
/// with a single atomic store.
#[derive(Debug)]
pub struct IdleClock {
    started: Instant,
    last_request_ms: AtomicU64,
}

impl IdleClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_request_ms: AtomicU64::new(0),
        }
    }

    /// Record a request arriving now
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_request_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last request (or since start, if none yet)
    pub fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_request_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

impl Default for IdleClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Why [`BridgeServer::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No request arrived within the idle timeout
    IdleTimeout,
    /// SIGTERM or SIGINT
    Signal,
    /// The shutdown handle was set
    Requested,
}

// =============================================================================
// Per-connection handling
// =============================================================================

/// Everything a connection handler thread shares with the daemon
#[derive(Clone)]
struct HandlerContext {
    connector: Arc<dyn KernelConnector>,
    clock: Arc<IdleClock>,
    /// Serializes kernel access across handler threads
    exec_lock: Arc<Mutex<()>>,
}

impl HandlerContext {
    /// Run one snippet against a freshly acquired kernel session
    fn execute(&self, code: &str) -> ExecutionResult {
        let code = strip_leading_comment(code);
        let _guard = self.exec_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let started = Instant::now();

        let outcome = self.connector.acquire().and_then(|mut session| {
            let events = session.execute(&code)?;
            aggregate(events)
        });

        match outcome {
            Ok(result) => {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    success = result.is_success(),
                    "execution finished"
                );
                result
            }
            Err(e) => {
                warn!(error = %e, "execution failed before producing a result");
                ExecutionResult::failure(e.to_string(), Vec::new())
            }
        }
    }

    /// AwaitingMessage -> Dispatching -> AwaitingMessage until the peer leaves
    fn serve(&self, conn: &mut Connection<TcpStream>) -> Result<()> {
        loop {
            let message = conn.read_message()?;

            match message.kind {
                MessageType::Request => {
                    self.clock.touch();
                    let result = self.execute(&message.text());

                    match result.failure_report() {
                        None => conn.write_message(MessageType::Success, result.output.as_bytes())?,
                        Some(report) => {
                            conn.write_message(MessageType::Failure, report.encode().as_bytes())?
                        }
                    }
                }
                other => {
                    return Err(BridgeError::Protocol(format!(
                        "unexpected {:?} message from client",
                        other
                    )));
                }
            }
        }
    }

    fn handle(&self, stream: TcpStream) {
        let mut conn = Connection::new(stream);
        let peer = conn.peer();
        debug!(%peer, "connection opened");

        match self.serve(&mut conn) {
            Err(e) if e.is_disconnect() => debug!(%peer, "connection closed by peer"),
            Err(e) => warn!(%peer, error = %e, "closing connection"),
            Ok(()) => {}
        }
    }
}

// =============================================================================
// BridgeServer
// =============================================================================

/// The bridge daemon: accept loop, handler threads, idle monitor
pub struct BridgeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: HandlerContext,
    idle_timeout: Duration,
    monitor_interval: Duration,
    /// Set by the shutdown handle
    shutdown: Arc<AtomicBool>,
    /// Set by SIGTERM / SIGINT
    signalled: Arc<AtomicBool>,
    /// Set by the idle monitor
    idle_expired: Arc<AtomicBool>,
    pid_file: Option<PathBuf>,
}

impl BridgeServer {
    /// Bind `127.0.0.1:<config.port>`
    ///
    /// A port that is already taken is reported as
    /// [`BridgeError::AlreadyRunning`].
    pub fn bind(config: &BridgeConfig, connector: Arc<dyn KernelConnector>) -> Result<Self> {
        let listener = match TcpListener::bind(("127.0.0.1", config.port)) {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                return Err(BridgeError::AlreadyRunning(config.port));
            }
            Err(e) => return Err(e.into()),
        };
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            context: HandlerContext {
                connector,
                clock: Arc::new(IdleClock::new()),
                exec_lock: Arc::new(Mutex::new(())),
            },
            idle_timeout: config.idle_timeout,
            monitor_interval: config.monitor_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            signalled: Arc::new(AtomicBool::new(false)),
            idle_expired: Arc::new(AtomicBool::new(false)),
            pid_file: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag that stops the accept loop when set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Setup signal handlers for graceful shutdown
    pub fn install_signal_handlers(&self) -> Result<()> {
        signal_hook::flag::register(SIGTERM, self.signalled.clone())?;
        signal_hook::flag::register(SIGINT, self.signalled.clone())?;
        Ok(())
    }

    /// Record our PID so `kbridged stop` can find us; removed on drop
    pub fn write_pid_file(&mut self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        self.pid_file = Some(path);
        Ok(())
    }

    fn stop_reason(&self) -> Option<ShutdownReason> {
        if self.signalled.load(Ordering::Relaxed) {
            Some(ShutdownReason::Signal)
        } else if self.idle_expired.load(Ordering::Relaxed) {
            Some(ShutdownReason::IdleTimeout)
        } else if self.shutdown.load(Ordering::Relaxed) {
            Some(ShutdownReason::Requested)
        } else {
            None
        }
    }

    /// Serve until shut down
    ///
    /// Handler threads still running when this returns are not waited for.
    pub fn run(&self) -> Result<ShutdownReason> {
        info!(
            addr = %self.local_addr,
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "kbridge daemon listening"
        );

        let stopping = Arc::new(AtomicBool::new(false));
        let monitor = self.spawn_idle_monitor(stopping.clone())?;

        let result = self.accept_loop();

        stopping.store(true, Ordering::Relaxed);
        if let Some(monitor) = monitor {
            let _ = monitor.join();
        }

        if let Ok(reason) = &result {
            info!(reason = ?reason, "kbridge daemon shutting down");
        }
        result
    }

    fn accept_loop(&self) -> Result<ShutdownReason> {
        // Non-blocking accept so the shutdown flags are polled
        self.listener.set_nonblocking(true)?;
        let mut accepted: u64 = 0;

        loop {
            if let Some(reason) = self.stop_reason() {
                return Ok(reason);
            }

            match self.listener.accept() {
                Ok((stream, addr)) => {
                    // Reset to blocking mode for the connection
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!(%addr, error = %e, "dropping connection");
                        continue;
                    }
                    accepted += 1;
                    self.spawn_handler(stream, accepted);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    error!(error = %e, "error accepting connection");
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                }
            }
        }
    }

    fn spawn_handler(&self, stream: TcpStream, id: u64) {
        let context = self.context.clone();
        let spawned = thread::Builder::new()
            .name(format!("kbridge-conn-{}", id))
            .spawn(move || context.handle(stream));

        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn connection handler");
        }
    }

    fn spawn_idle_monitor(&self, stopping: Arc<AtomicBool>) -> Result<Option<JoinHandle<()>>> {
        if self.idle_timeout.is_zero() {
            return Ok(None);
        }

        let clock = self.context.clock.clone();
        let expired = self.idle_expired.clone();
        let timeout = self.idle_timeout;
        let interval = self.monitor_interval;

        let handle = thread::Builder::new()
            .name("kbridge-idle".to_string())
            .spawn(move || {
                while !stopping.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    let idle = clock.idle_for();
                    if idle >= timeout {
                        info!(idle_secs = idle.as_secs(), "idle timeout reached");
                        expired.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            })?;

        Ok(Some(handle))
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        if let Some(path) = self.pid_file.take() {
            let _ = fs::remove_file(path);
        }
    }
}
