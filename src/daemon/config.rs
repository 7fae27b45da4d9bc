//! Bridge configuration
//!
//! Values are layered, later sources winning:
//! 1. built-in defaults
//! 2. `~/.kbridgerc` (shell-style `KBRIDGE_<NAME>=value` assignments)
//! 3. environment variables with the same names
//! 4. command-line flags (applied by the binaries)
//!
//! Recognized keys:
//! - KBRIDGE_PORT (TCP port on 127.0.0.1)
//! - KBRIDGE_IDLE_TIMEOUT (seconds, 0 = never; applies to client-spawned daemons)
//! - KBRIDGE_CONNECTION_DIR (where kernels write connection files)
//! - KBRIDGE_STATE_DIR (PID files)
//! - KBRIDGE_SPAWN_WAIT (milliseconds the client waits for a spawned daemon)
//! - KBRIDGE_PROBE_TIMEOUT (milliseconds per kernel reachability probe)
//! - KBRIDGE_DAEMON (path to the kbridged executable)
//! - KBRIDGE_PYTHON (interpreter used by `kbridged kernel`)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default daemon port
pub const DEFAULT_PORT: u16 = 48721;

/// Idle timeout handed to daemons the client spawns on demand
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// How often the idle monitor wakes up
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// How long the client waits for a freshly spawned daemon to accept
pub const DEFAULT_SPAWN_WAIT: Duration = Duration::from_millis(2000);

/// Per-kernel reachability probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Complete bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub port: u16,
    /// Zero never expires
    pub idle_timeout: Duration,
    pub monitor_interval: Duration,
    pub connection_dir: PathBuf,
    pub state_dir: PathBuf,
    pub spawn_wait: Duration,
    pub probe_timeout: Duration,
    /// Explicit daemon executable; `None` looks next to the current binary
    pub daemon_program: Option<PathBuf>,
    pub python: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let state_dir = default_state_dir();
        Self {
            port: DEFAULT_PORT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            connection_dir: state_dir.join("kernels"),
            state_dir,
            spawn_wait: DEFAULT_SPAWN_WAIT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            daemon_program: None,
            python: "python3".to_string(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kbridge")
}

impl BridgeConfig {
    /// Defaults, then `~/.kbridgerc`, then the process environment
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(content) = Self::read_rc(&Self::rc_path()) {
            config.apply(&parse_assignments(&content));
        }
        config.apply(&std::env::vars().collect());
        config
    }

    /// Get the path to .kbridgerc
    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kbridgerc")
    }

    fn read_rc(path: &Path) -> Option<String> {
        fs::read_to_string(path).ok()
    }

    /// Parse configuration from rc file content over the defaults
    pub fn parse(content: &str) -> Self {
        let mut config = Self::default();
        config.apply(&parse_assignments(content));
        config
    }

    /// Overlay recognized `KBRIDGE_*` keys; unparsable values are skipped
    pub fn apply(&mut self, values: &HashMap<String, String>) {
        for (key, value) in values {
            match key.as_str() {
                "KBRIDGE_PORT" => {
                    if let Some(port) = parse_number::<u16>(key, value) {
                        self.port = port;
                    }
                }
                "KBRIDGE_IDLE_TIMEOUT" => {
                    if let Some(secs) = parse_number::<u64>(key, value) {
                        self.idle_timeout = Duration::from_secs(secs);
                    }
                }
                "KBRIDGE_SPAWN_WAIT" => {
                    if let Some(ms) = parse_number::<u64>(key, value) {
                        self.spawn_wait = Duration::from_millis(ms);
                    }
                }
                "KBRIDGE_PROBE_TIMEOUT" => {
                    if let Some(ms) = parse_number::<u64>(key, value) {
                        self.probe_timeout = Duration::from_millis(ms);
                    }
                }
                "KBRIDGE_CONNECTION_DIR" => {
                    self.connection_dir = expand_home(value);
                }
                "KBRIDGE_STATE_DIR" => {
                    self.state_dir = expand_home(value);
                }
                "KBRIDGE_DAEMON" if !value.is_empty() => {
                    self.daemon_program = Some(expand_home(value));
                }
                "KBRIDGE_PYTHON" if !value.is_empty() => {
                    self.python = value.clone();
                }
                _ => {}
            }
        }
    }

    /// PID file recorded by the daemon listening on `port`
    pub fn pid_file(&self, port: u16) -> PathBuf {
        self.state_dir.join(format!("daemon-{}.pid", port))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value, "ignoring invalid numeric setting");
            None
        }
    }
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(value),
    }
}

/// Collect `KEY=value` assignments, skipping comments and blank lines
fn parse_assignments(content: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Handle both `KEY=value` and `export KEY=value`
        let line = line.strip_prefix("export ").unwrap_or(line);

        if let Some((key, value)) = parse_assignment(line) {
            values.insert(key, unquote(&value));
        }
    }

    values
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim().to_string();

    // Validate key is a valid identifier
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value.trim().to_string()))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config = BridgeConfig::parse("");
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_rc() {
        let content = r#"
# kbridge settings
KBRIDGE_PORT=50000
export KBRIDGE_IDLE_TIMEOUT="30"
KBRIDGE_CONNECTION_DIR='/tmp/kernels'
KBRIDGE_SPAWN_WAIT=250
KBRIDGE_DAEMON="/opt/kbridge/kbridged"
KBRIDGE_PYTHON=python3.12
"#;
        let config = BridgeConfig::parse(content);

        assert_eq!(config.port, 50000);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.connection_dir, PathBuf::from("/tmp/kernels"));
        assert_eq!(config.spawn_wait, Duration::from_millis(250));
        assert_eq!(config.daemon_program, Some(PathBuf::from("/opt/kbridge/kbridged")));
        assert_eq!(config.python, "python3.12");
    }

    #[test]
    fn test_invalid_numbers_keep_defaults() {
        let config = BridgeConfig::parse("KBRIDGE_PORT=99999\nKBRIDGE_IDLE_TIMEOUT=soon");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn test_later_layer_wins() {
        let mut config = BridgeConfig::parse("KBRIDGE_PORT=50000");
        let env: HashMap<String, String> =
            [("KBRIDGE_PORT".to_string(), "50001".to_string())].into_iter().collect();
        config.apply(&env);
        assert_eq!(config.port, 50001);
    }

    #[test]
    fn test_unrelated_keys_ignored() {
        let config = BridgeConfig::parse("PATH=/usr/bin\nnot an assignment\nKBRIDGE_UNKNOWN=1");
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_pid_file_per_port() {
        let config = BridgeConfig::parse("KBRIDGE_STATE_DIR=/var/tmp/kb");
        assert_eq!(config.pid_file(48721), PathBuf::from("/var/tmp/kb/daemon-48721.pid"));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("  \"hello\"  "), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
