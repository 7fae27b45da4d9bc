//! Starting the daemon as a detached background process

use crate::daemon::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the daemon executable
pub const DAEMON_BINARY: &str = "kbridged";

/// Builds and runs `kbridged start ...`
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
    program: PathBuf,
    port: u16,
    idle_timeout: Duration,
    connection_dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
}

impl DaemonLauncher {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            program: Self::resolve_program(config),
            port: config.port,
            idle_timeout: config.idle_timeout,
            connection_dir: Some(config.connection_dir.clone()),
            envs: Vec::new(),
        }
    }

    pub fn new(program: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            program: program.into(),
            port,
            idle_timeout: Duration::ZERO,
            connection_dir: None,
            envs: Vec::new(),
        }
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn connection_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.connection_dir = Some(dir.into());
        self
    }

    /// Extra environment for the daemon process
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Configured path, else `kbridged` next to the running executable,
    /// else `kbridged` from PATH
    pub fn resolve_program(config: &BridgeConfig) -> PathBuf {
        if let Some(program) = &config.daemon_program {
            return program.clone();
        }

        env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY)))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY))
    }

    /// The foreground `start` invocation, detached from our stdio
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("start")
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--idle-timeout")
            .arg(self.idle_timeout.as_secs().to_string());
        if let Some(dir) = &self.connection_dir {
            cmd.arg("--connection-dir").arg(dir);
        }
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group, so the editor's signals do not reach the daemon
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd
    }

    /// Start the daemon without waiting for it; returns its PID
    ///
    /// A detached thread waits on the child and reaps it whenever it exits.
    pub fn spawn(&self) -> Result<u32> {
        let child = self
            .command()
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {}", self.program.display(), e)))?;
        let pid = child.id();

        info!(pid, port = self.port, program = %self.program.display(), "spawned daemon");
        reap(child);
        Ok(pid)
    }
}

fn reap(mut child: Child) {
    let pid = child.id();
    let spawned = thread::Builder::new()
        .name(format!("kbridge-reap-{}", pid))
        .spawn(move || match child.wait() {
            Ok(status) => debug!(pid, %status, "spawned daemon exited"),
            Err(e) => debug!(pid, error = %e, "could not wait for spawned daemon"),
        });

    if let Err(e) = spawned {
        warn!(pid, error = %e, "no reaper thread for spawned daemon");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let launcher = DaemonLauncher::new("/opt/kbridged", 50000)
            .idle_timeout(Duration::from_secs(90))
            .connection_dir("/tmp/kernels");
        let cmd = launcher.command();

        assert_eq!(cmd.get_program(), "/opt/kbridged");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["start", "--port", "50000", "--idle-timeout", "90", "--connection-dir", "/tmp/kernels"]
        );
    }

    #[test]
    fn test_configured_program_wins() {
        let config = BridgeConfig {
            daemon_program: Some(PathBuf::from("/custom/kbridged")),
            ..BridgeConfig::default()
        };
        assert_eq!(DaemonLauncher::resolve_program(&config), PathBuf::from("/custom/kbridged"));
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let launcher = DaemonLauncher::new("/nonexistent/kbridged", 1);
        assert!(matches!(launcher.spawn(), Err(BridgeError::Spawn(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_exited_daemon_is_reaped() {
        // `true` ignores the start arguments and exits at once
        let pid = DaemonLauncher::new("true", 1).spawn().unwrap();
        let proc_entry = PathBuf::from(format!("/proc/{}", pid));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while proc_entry.exists() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!proc_entry.exists(), "child {} left as a zombie", pid);
    }
}
