// Shared helpers for the integration tests
#![allow(dead_code)]

use kbridge::daemon::{BridgeClient, BridgeConfig, BridgeServer, ShutdownReason};
use kbridge::kernel::{EventStream, KernelConnector, KernelEvent, KernelSession};
use kbridge::{BridgeError, Result};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// In-process daemon running on a background thread
pub struct TestDaemon {
    pub addr: SocketAddr,
    pub shutdown: Arc<AtomicBool>,
    pub handle: Option<JoinHandle<Result<ShutdownReason>>>,
}

impl TestDaemon {
    pub fn start(connector: Arc<dyn KernelConnector>) -> Self {
        Self::start_with(connector, Duration::ZERO, Duration::from_millis(100))
    }

    pub fn start_with(
        connector: Arc<dyn KernelConnector>,
        idle_timeout: Duration,
        monitor_interval: Duration,
    ) -> Self {
        let config = BridgeConfig {
            port: 0,
            idle_timeout,
            monitor_interval,
            ..BridgeConfig::default()
        };
        let server = BridgeServer::bind(&config, connector).unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        Self {
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn client(&self) -> BridgeClient {
        let config = BridgeConfig {
            port: self.addr.port(),
            ..BridgeConfig::default()
        };
        BridgeClient::new(&config).without_spawn()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait up to `limit` for the accept loop to return
    pub fn wait(&mut self, limit: Duration) -> Option<ShutdownReason> {
        let deadline = Instant::now() + limit;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(20));
        }
        self.handle.take().and_then(|h| h.join().ok()).and_then(|r| r.ok())
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Tiny scripted interpreter
///
/// - `1+1` -> result `2`
/// - `1/0` -> ZeroDivisionError with a three-entry traceback
/// - `print:<text>` -> stdout stream
/// - `burst:<tag>` -> 20 stdout events of `<tag>` with short pauses
/// - `sleep:<ms>` -> waits, then result `slept`
/// - anything else -> result echoing the code
pub struct ScriptedKernel;

impl ScriptedKernel {
    fn events(code: &str) -> Vec<KernelEvent> {
        let code = code.trim();
        let mut events = Vec::new();

        if code == "1+1" {
            events.push(KernelEvent::Result {
                text: "2".to_string(),
            });
        } else if code == "1/0" {
            events.push(KernelEvent::Error {
                ename: "ZeroDivisionError".to_string(),
                evalue: "division by zero".to_string(),
                traceback: vec![
                    "\x1b[0;31m---------------------------------------------------------------------------\x1b[0m\n\x1b[0;31mZeroDivisionError\x1b[0m Traceback (most recent call last)".to_string(),
                    "\x1b[0;32m<kbridge-input-1>\x1b[0m in \x1b[0;36m<module>\x1b[0m\n\x1b[0;32m----> 1\x1b[0m 1/0".to_string(),
                    "\x1b[0;31mZeroDivisionError\x1b[0m: division by zero".to_string(),
                ],
            });
        } else if let Some(text) = code.strip_prefix("print:") {
            events.push(KernelEvent::Stream {
                channel: "stdout".to_string(),
                text: format!("{}\n", text),
            });
        } else if let Some(tag) = code.strip_prefix("burst:") {
            for _ in 0..20 {
                events.push(KernelEvent::Stream {
                    channel: "stdout".to_string(),
                    text: tag.to_string(),
                });
            }
        } else if code.starts_with("sleep:") {
            events.push(KernelEvent::Result {
                text: "slept".to_string(),
            });
        } else {
            events.push(KernelEvent::Result {
                text: code.to_string(),
            });
        }

        events.push(KernelEvent::Idle);
        events
    }
}

impl KernelSession for ScriptedKernel {
    fn execute(&mut self, code: &str) -> Result<EventStream<'_>> {
        let pause = if code.trim().starts_with("burst:") {
            Duration::from_millis(2)
        } else {
            Duration::ZERO
        };
        if let Some(ms) = code.trim().strip_prefix("sleep:") {
            thread::sleep(Duration::from_millis(ms.parse().unwrap_or(0)));
        }

        Ok(Box::new(Self::events(code).into_iter().map(move |event| {
            thread::sleep(pause);
            Ok(event)
        })))
    }
}

/// Connector handing out [`ScriptedKernel`]s and counting acquisitions
#[derive(Default)]
pub struct ScriptedConnector {
    pub acquired: AtomicUsize,
}

impl KernelConnector for ScriptedConnector {
    fn acquire(&self) -> Result<Box<dyn KernelSession>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedKernel))
    }
}

/// Connector that never finds a kernel
pub struct NoKernelConnector;

impl KernelConnector for NoKernelConnector {
    fn acquire(&self) -> Result<Box<dyn KernelSession>> {
        Err(BridgeError::NoSessionFound(
            "none of 0 connection file(s) in /nonexistent is reachable".to_string(),
        ))
    }
}
