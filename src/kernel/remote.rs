//! JSON-lines kernel transport over TCP
//!
//! Each request is one line `{"code": "..."}`; the kernel answers with one
//! [`KernelEvent`] per line and finishes with `{"event": "idle"}`.

use crate::error::{BridgeError, Result};
use crate::kernel::discovery::{find_alive_kernel, ConnectionInfo};
use crate::kernel::{EventStream, KernelConnector, KernelEvent, KernelSession};
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
}

/// A connected session to one kernel
pub struct TcpKernel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TcpKernel {
    pub fn connect(info: &ConnectionInfo, timeout: Duration) -> Result<Self> {
        let addr = info.socket_addr()?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        debug!(%addr, "connected to kernel");

        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn next_event(&mut self) -> Result<Option<KernelEvent>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(BridgeError::from_stream_io)?;
            if read == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }
}

impl KernelSession for TcpKernel {
    fn execute(&mut self, code: &str) -> Result<EventStream<'_>> {
        let mut request = serde_json::to_vec(&ExecuteRequest { code })?;
        request.push(b'\n');
        self.writer
            .write_all(&request)
            .and_then(|_| self.writer.flush())
            .map_err(BridgeError::from_stream_io)?;

        let mut finished = false;
        Ok(Box::new(std::iter::from_fn(move || {
            if finished {
                return None;
            }
            match self.next_event() {
                Ok(Some(event)) => {
                    finished = event == KernelEvent::Idle;
                    Some(Ok(event))
                }
                Ok(None) => {
                    finished = true;
                    Some(Err(BridgeError::Kernel(
                        "kernel closed the connection before finishing".to_string(),
                    )))
                }
                Err(e) => {
                    finished = true;
                    Some(Err(e))
                }
            }
        })))
    }
}

/// Discovers a kernel afresh on every `acquire`
pub struct DiscoveryConnector {
    connection_dir: PathBuf,
    probe_timeout: Duration,
}

impl DiscoveryConnector {
    pub fn new(connection_dir: impl Into<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            connection_dir: connection_dir.into(),
            probe_timeout,
        }
    }
}

impl KernelConnector for DiscoveryConnector {
    fn acquire(&self) -> Result<Box<dyn KernelSession>> {
        let info = find_alive_kernel(&self.connection_dir, self.probe_timeout)?;
        let kernel = TcpKernel::connect(&info, self.probe_timeout)?;
        Ok(Box::new(kernel))
    }
}
