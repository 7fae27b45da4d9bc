//! Traceback extraction
//!
//! Interpreters report errors as a list of (often colorized) traceback
//! entries. This module strips the color codes and turns the entries into
//! [`TracebackFrame`] records.
//!
//! Two shapes are recognized:
//! - a single entry, e.g. a syntax error: `File "<input>", line 3`
//! - several entries, where the first and last are header/footer text and each
//!   entry in between looks like `<file> in <function>` followed by a
//!   `---->  N` marker naming the line

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Source label for frames that do not name a file
pub const NO_SOURCE: &str = "<input>";

/// Source label when a frame line could not be parsed
pub const UNKNOWN_SOURCE: &str = "unknown";

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[mK]").expect("valid ANSI pattern"));

static TRAILING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r", line (\d+)").expect("valid line pattern"));

static FRAME_SOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\S+ in \S+)").expect("valid source pattern"));

static FRAME_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-->\s*(\d+)").expect("valid marker pattern"));

/// One (source, line, text) record of a call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackFrame {
    /// File and function label, or a sentinel
    pub source: String,
    /// Line number; `None` when it could not be determined
    pub line: Option<u32>,
    /// The cleaned traceback entry
    pub text: String,
}

impl TracebackFrame {
    /// `source:line` for display, with `unknown` for a missing line
    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.source, line),
            None => format!("{}:unknown", self.source),
        }
    }
}

impl fmt::Display for TracebackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.location(), self.text)
    }
}

/// Remove CSI color (SGR) and erase-line sequences
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Extract frames from a raw traceback entry list
pub fn parse_traceback<S: AsRef<str>>(entries: &[S]) -> Vec<TracebackFrame> {
    let cleaned: Vec<String> = entries.iter().map(|e| strip_ansi(e.as_ref())).collect();

    match cleaned.len() {
        0 => Vec::new(),
        1 => vec![single_frame(&cleaned[0])],
        n => cleaned[1..n - 1].iter().map(|entry| stack_frame(entry)).collect(),
    }
}

fn single_frame(entry: &str) -> TracebackFrame {
    let line = TRAILING_LINE
        .captures_iter(entry)
        .last()
        .and_then(|caps| caps[1].parse().ok());

    TracebackFrame {
        source: NO_SOURCE.to_string(),
        line,
        text: entry.to_string(),
    }
}

fn stack_frame(entry: &str) -> TracebackFrame {
    let source = FRAME_SOURCE
        .captures(entry)
        .map(|caps| caps[1].to_string());
    let line = FRAME_LINE
        .captures(entry)
        .and_then(|caps| caps[1].parse().ok());

    if source.is_none() || line.is_none() {
        debug!(
            has_source = source.is_some(),
            has_line = line.is_some(),
            "malformed traceback entry, keeping raw text"
        );
    }

    TracebackFrame {
        source: source.unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
        line,
        text: entry.to_string(),
    }
}
