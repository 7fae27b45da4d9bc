//! Response aggregation
//!
//! Folds the event stream of one execution into a single [`ExecutionResult`].
//! Output events are joined line by line in arrival order; the first error
//! wins; everything up to `idle` is drained so the channel is left clean.

use crate::daemon::protocol::FailureReport;
use crate::error::Result;
use crate::kernel::traceback::{parse_traceback, TracebackFrame};
use crate::kernel::KernelEvent;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// An execution error: `"<class>: <value>"` plus its call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    pub frames: Vec<TracebackFrame>,
}

/// Outcome of executing one snippet
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, frames: Vec<TracebackFrame>) -> Self {
        Self {
            output: String::new(),
            error: Some(ExecutionError {
                message: message.into(),
                frames,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Failure payload for the wire, if this is a failure
    pub fn failure_report(&self) -> Option<FailureReport> {
        self.error.as_ref().map(|error| FailureReport {
            message: error.message.clone(),
            frames: error.frames.clone(),
        })
    }
}

impl From<FailureReport> for ExecutionResult {
    fn from(report: FailureReport) -> Self {
        ExecutionResult::failure(report.message, report.frames)
    }
}

/// Consume events until `idle` and build the result
///
/// A transport error aborts aggregation. A stream that ends without `idle`
/// is treated as finished.
pub fn aggregate<I>(events: I) -> Result<ExecutionResult>
where
    I: IntoIterator<Item = Result<KernelEvent>>,
{
    let mut lines: Vec<String> = Vec::new();
    let mut error: Option<ExecutionError> = None;
    let mut saw_idle = false;

    for event in events {
        match event? {
            KernelEvent::Stream { channel, text } => {
                lines.push(format!("{}: {}", channel, trim_newline(&text)));
            }
            KernelEvent::Result { text } => {
                lines.push(trim_newline(&text).to_string());
            }
            KernelEvent::Error {
                ename,
                evalue,
                traceback,
            } => {
                if error.is_some() {
                    debug!(ename = %ename, "ignoring error after the first one");
                    continue;
                }
                error = Some(ExecutionError {
                    message: format!("{}: {}", ename, evalue),
                    frames: parse_traceback(&traceback),
                });
            }
            KernelEvent::Idle => {
                saw_idle = true;
                break;
            }
        }
    }

    if !saw_idle {
        warn!("kernel event stream ended before idle");
    }

    Ok(ExecutionResult {
        output: lines.join("\n"),
        error,
    })
}

fn trim_newline(text: &str) -> &str {
    text.trim_end_matches(['\n', '\r'])
}
