//! kbridge daemon client
//!
//! Thin client logic for connecting to the daemon (starting it on first use)
//! and executing one snippet per connection.

use crate::daemon::config::BridgeConfig;
use crate::daemon::connection::Connection;
use crate::daemon::launcher::DaemonLauncher;
use crate::daemon::protocol::{FailureReport, Message, MessageType};
use crate::error::{BridgeError, Result};
use crate::kernel::ExecutionResult;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Gap between connection attempts while a spawned daemon starts up
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Client for the kbridge daemon
pub struct BridgeClient {
    addr: SocketAddr,
    launcher: Option<DaemonLauncher>,
    spawn_wait: Duration,
}

impl BridgeClient {
    /// Client for the configured port that spawns the daemon when absent
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, config.port)),
            launcher: Some(DaemonLauncher::from_config(config)),
            spawn_wait: config.spawn_wait,
        }
    }

    /// Never start a daemon; fail if none is listening
    pub fn without_spawn(mut self) -> Self {
        self.launcher = None;
        self
    }

    pub fn with_launcher(mut self, launcher: DaemonLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_spawn_wait(mut self, wait: Duration) -> Self {
        self.spawn_wait = wait;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Check if a daemon is accepting connections
    pub fn is_daemon_running(&self) -> bool {
        TcpStream::connect(self.addr).is_ok()
    }

    /// Execute code through the daemon
    pub fn execute(&self, code: &str) -> Result<ExecutionResult> {
        let stream = self.connect_or_spawn()?;
        let mut conn = Connection::new(stream);

        let response = round_trip(&mut conn, code);
        // Close before looking at the outcome
        drop(conn);

        let response = response?;
        match response.kind {
            MessageType::Success => Ok(ExecutionResult::success(response.text())),
            MessageType::Failure => Ok(FailureReport::decode(&response.text()).into()),
            MessageType::Request => Err(BridgeError::Protocol(
                "daemon answered with a request message".to_string(),
            )),
        }
    }

    fn connect_or_spawn(&self) -> Result<TcpStream> {
        let first_error = match TcpStream::connect(self.addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        let Some(launcher) = &self.launcher else {
            return Err(self.unreachable(&first_error));
        };

        debug!(addr = %self.addr, error = %first_error, "no daemon listening, spawning one");
        launcher.spawn()?;

        wait_for_listener(self.addr, self.spawn_wait).map_err(|e| self.unreachable(&e))
    }

    fn unreachable(&self, err: &io::Error) -> BridgeError {
        BridgeError::DaemonUnreachable {
            addr: self.addr.to_string(),
            reason: err.to_string(),
        }
    }
}

fn round_trip(conn: &mut Connection<TcpStream>, code: &str) -> Result<Message> {
    conn.get_ref().set_nodelay(true)?;
    conn.write_message(MessageType::Request, code.as_bytes())?;
    conn.read_message()
}

/// Connect repeatedly until `addr` accepts or `wait` elapses
pub fn wait_for_listener(addr: SocketAddr, wait: Duration) -> io::Result<TcpStream> {
    let deadline = Instant::now() + wait;

    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => thread::sleep(READY_POLL_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(port: u16) -> BridgeConfig {
        BridgeConfig {
            port,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn test_no_daemon_without_spawn() {
        let client = BridgeClient::new(&config(free_port())).without_spawn();
        assert!(!client.is_daemon_running());
        assert!(matches!(
            client.execute("1+1"),
            Err(BridgeError::DaemonUnreachable { .. })
        ));
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let port = free_port();
        let client = BridgeClient::new(&config(port))
            .with_launcher(DaemonLauncher::new("/nonexistent/kbridged", port));
        assert!(matches!(client.execute("1+1"), Err(BridgeError::Spawn(_))));
    }

    #[test]
    fn test_spawned_process_that_never_listens() {
        let port = free_port();
        // `true` exits immediately without binding anything
        let client = BridgeClient::new(&config(port))
            .with_launcher(DaemonLauncher::new("true", port))
            .with_spawn_wait(Duration::from_millis(200));

        let started = Instant::now();
        assert!(matches!(
            client.execute("1+1"),
            Err(BridgeError::DaemonUnreachable { .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_wait_for_listener_sees_late_bind() {
        let port = free_port();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let binder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            let listener = TcpListener::bind(addr).unwrap();
            let _ = listener.accept();
        });

        assert!(wait_for_listener(addr, Duration::from_secs(2)).is_ok());
        binder.join().unwrap();
    }

    #[test]
    fn test_unexpected_request_reply_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = Connection::new(stream);
            let request = conn.read_message().unwrap();
            conn.write_message(MessageType::Request, &request.payload).unwrap();
        });

        let client = BridgeClient::new(&config(port)).without_spawn();
        assert!(matches!(client.execute("1"), Err(BridgeError::Protocol(_))));
        server.join().unwrap();
    }
}
