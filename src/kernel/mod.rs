//! Interpreter-facing side of the bridge
//!
//! - `KernelEvent`: the tagged event stream an interpreter emits per execution
//! - `KernelSession` / `KernelConnector`: the seam between the daemon and a
//!   concrete interpreter transport
//! - `response`: folds events into an [`ExecutionResult`]
//! - `traceback`: structured traceback extraction
//! - `discovery`: finds running interpreters through connection files
//! - `remote`: JSON-lines TCP transport to a discovered interpreter

pub mod discovery;
pub mod remote;
pub mod response;
pub mod traceback;

pub use discovery::{find_alive_kernel, ConnectionInfo};
pub use remote::{DiscoveryConnector, TcpKernel};
pub use response::{aggregate, ExecutionError, ExecutionResult};
pub use traceback::{parse_traceback, strip_ansi, TracebackFrame};

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// The Python kernel shipped with kbridge, run by `kbridged kernel`
pub const PYTHON_DRIVER: &str = include_str!("driver.py");

/// One message from an interpreter during an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    /// Text written to a named output channel (stdout, stderr)
    Stream { channel: String, text: String },
    /// The value of the last expression
    Result { text: String },
    /// An uncaught exception
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// The interpreter finished this execution
    Idle,
}

/// Events of one execution, in arrival order
pub type EventStream<'a> = Box<dyn Iterator<Item = Result<KernelEvent>> + 'a>;

/// One interpreter's execution channel
pub trait KernelSession: Send {
    /// Submit code; the returned stream ends with [`KernelEvent::Idle`]
    fn execute(&mut self, code: &str) -> Result<EventStream<'_>>;
}

/// Hands out a kernel session for each request
///
/// The daemon calls `acquire` once per request and drops the session when the
/// response has been built.
pub trait KernelConnector: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn KernelSession>>;
}

/// Blank a comment on the first line, keeping line numbers intact
///
/// Only a first line of `#` followed by at least one character is blanked.
/// Later lines are never touched.
pub fn strip_leading_comment(code: &str) -> String {
    let first_len = code.find('\n').unwrap_or(code.len());
    if code.starts_with('#') && first_len > 1 {
        code[first_len..].to_string()
    } else {
        code.to_string()
    }
}
