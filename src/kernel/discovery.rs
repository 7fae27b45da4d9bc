//! Kernel discovery through connection files
//!
//! A running interpreter advertises itself by writing a JSON connection file
//! into a well-known directory. Discovery lists those files (newest first),
//! parses them, and probes each advertised address until one answers.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Contents of a kernel connection file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub shell_port: u16,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn default_transport() -> String {
    "tcp".to_string()
}

impl ConnectionInfo {
    pub fn new(ip: impl Into<String>, shell_port: u16) -> Self {
        Self {
            ip: ip.into(),
            shell_port,
            transport: default_transport(),
            pid: None,
            kernel_name: None,
            key: None,
        }
    }

    /// Parse a connection file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            BridgeError::Kernel(format!("invalid connection file {}: {}", path.display(), e))
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.ip.as_str(), self.shell_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                BridgeError::Kernel(format!("cannot resolve {}:{}", self.ip, self.shell_port))
            })
    }
}

/// Connection file found on disk, with its probe result
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub info: ConnectionInfo,
    pub reachable: bool,
}

/// True if something accepts TCP connections at `addr`
pub fn probe(addr: &SocketAddr, timeout: Duration) -> bool {
    match TcpStream::connect_timeout(addr, timeout) {
        Ok(stream) => {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            true
        }
        Err(e) => {
            debug!(%addr, error = %e, "kernel probe failed");
            false
        }
    }
}

/// `*.json` files in `dir`, newest first
fn connection_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        BridgeError::NoSessionFound(format!("cannot read {}: {}", dir.display(), e))
    })?;

    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "error reading connection directory entry");
                continue;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((modified, path));
    }

    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Parse every connection file in `dir` and probe it
///
/// Unparsable files and non-TCP transports are skipped.
pub fn scan(dir: &Path, timeout: Duration) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();

    for path in connection_files(dir)? {
        let info = match ConnectionInfo::from_file(&path) {
            Ok(info) => info,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping connection file");
                continue;
            }
        };
        if info.transport != "tcp" {
            debug!(path = %path.display(), transport = %info.transport, "skipping non-tcp kernel");
            continue;
        }
        let reachable = match info.socket_addr() {
            Ok(addr) => probe(&addr, timeout),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unresolvable kernel address");
                false
            }
        };
        candidates.push(Candidate {
            path,
            info,
            reachable,
        });
    }

    Ok(candidates)
}

/// The newest reachable kernel advertised in `dir`
pub fn find_alive_kernel(dir: &Path, timeout: Duration) -> Result<ConnectionInfo> {
    let candidates = scan(dir, timeout)?;
    let total = candidates.len();

    candidates
        .into_iter()
        .find(|candidate| candidate.reachable)
        .map(|candidate| {
            debug!(path = %candidate.path.display(), port = candidate.info.shell_port, "found kernel");
            candidate.info
        })
        .ok_or_else(|| {
            BridgeError::NoSessionFound(format!(
                "none of {} connection file(s) in {} is reachable; start one with `kbridged kernel`",
                total,
                dir.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::TempDir;

    const PROBE: Duration = Duration::from_millis(200);

    fn write_info(dir: &Path, name: &str, info: &ConnectionInfo) {
        let json = serde_json::to_string(info).unwrap();
        fs::write(dir.join(name), json).unwrap();
    }

    /// A port that was free a moment ago
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_parse_minimal_connection_file() {
        let info: ConnectionInfo =
            serde_json::from_str(r#"{"ip": "127.0.0.1", "shell_port": 53794, "iopub_port": 1}"#)
                .unwrap();
        assert_eq!(info, ConnectionInfo::new("127.0.0.1", 53794));
    }

    #[test]
    fn test_missing_directory_is_no_session() {
        let dir = TempDir::new().unwrap();
        let err = find_alive_kernel(&dir.path().join("absent"), PROBE).unwrap_err();
        assert!(matches!(err, BridgeError::NoSessionFound(_)));
    }

    #[test]
    fn test_finds_reachable_kernel() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live_port = listener.local_addr().unwrap().port();

        write_info(dir.path(), "kernel-dead.json", &ConnectionInfo::new("127.0.0.1", closed_port()));
        write_info(dir.path(), "kernel-live.json", &ConnectionInfo::new("127.0.0.1", live_port));
        fs::write(dir.path().join("kernel-broken.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let info = find_alive_kernel(dir.path(), PROBE).unwrap();
        assert_eq!(info.shell_port, live_port);

        let candidates = scan(dir.path(), PROBE).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates.iter().filter(|c| c.reachable).count(), 1);
    }

    #[test]
    fn test_only_dead_kernels() {
        let dir = TempDir::new().unwrap();
        write_info(dir.path(), "kernel-1.json", &ConnectionInfo::new("127.0.0.1", closed_port()));

        let err = find_alive_kernel(dir.path(), PROBE).unwrap_err();
        assert!(err.to_string().contains("1 connection file"));
    }

    #[test]
    fn test_non_tcp_transport_skipped() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut info = ConnectionInfo::new("127.0.0.1", listener.local_addr().unwrap().port());
        info.transport = "ipc".to_string();
        write_info(dir.path(), "kernel-ipc.json", &info);

        assert!(scan(dir.path(), PROBE).unwrap().is_empty());
    }
}
