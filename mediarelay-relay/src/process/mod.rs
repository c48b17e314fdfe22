//! OS-level control of relay processes
//!
//! A relay process copies one stream URL to another. The manager only
//! mediates process control; which hop a process belongs to is recorded on
//! the hop's `process_id`.

use async_trait::async_trait;
use dashmap::DashMap;
use mediarelay_core::config::RelayConfig;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{RelayError, RelayResult};

/// OS process id of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessHandle(u32);

impl ProcessHandle {
    #[must_use]
    pub const fn from_pid(pid: u32) -> Self {
        Self(pid)
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Launch a relay from `input_url` to `output_url`.
    async fn start(&self, input_url: &str, output_url: &str) -> RelayResult<ProcessHandle>;

    /// False for handles that exited or were never started here.
    async fn is_running(&self, handle: ProcessHandle) -> RelayResult<bool>;

    /// Terminate the process. Killing a dead handle is a no-op.
    async fn kill(&self, handle: ProcessHandle) -> RelayResult<()>;
}

/// Spawns the configured relay program as child processes.
///
/// Children are kept in a map keyed by pid. `kill` removes the child from
/// the map before signalling it, so a kill racing a probe or a second kill
/// never touches the same `Child` twice.
pub struct RelayProcessManager {
    program: String,
    args: Vec<String>,
    stop_timeout: Duration,
    children: DashMap<ProcessHandle, Child>,
}

impl RelayProcessManager {
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            stop_timeout: config.stop_timeout(),
            children: DashMap::new(),
        }
    }

    /// Number of children currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.children.len()
    }

    fn render_args(&self, input_url: &str, output_url: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{input}", input_url).replace("{output}", output_url))
            .collect()
    }

    /// Non-blocking liveness check; reaps the child when it has exited.
    fn probe(&self, handle: ProcessHandle) -> bool {
        {
            let Some(mut child) = self.children.get_mut(&handle) else {
                return false;
            };
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => {
                    debug!(pid = handle.pid(), status = %status, "Relay process exited");
                }
                Err(e) => {
                    warn!(pid = handle.pid(), error = %e, "Failed to poll relay process");
                }
            }
        }

        // guard released above; removing while holding it would deadlock
        self.children.remove(&handle);
        false
    }

    /// Kill every tracked child.
    pub async fn shutdown(&self) {
        let handles: Vec<ProcessHandle> = self.children.iter().map(|e| *e.key()).collect();
        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), "Stopping relay processes");
        for handle in handles {
            // kill never fails for tracked handles
            let _ = self.kill(handle).await;
        }
    }
}

#[async_trait]
impl ProcessController for RelayProcessManager {
    async fn start(&self, input_url: &str, output_url: &str) -> RelayResult<ProcessHandle> {
        let mut child = Command::new(&self.program)
            .args(self.render_args(input_url, output_url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::ProcessStartFailed(format!("{}: {e}", self.program)))?;

        let Some(pid) = child.id() else {
            return Err(RelayError::ProcessStartFailed(format!(
                "{} exited during start",
                self.program
            )));
        };
        let handle = ProcessHandle::from_pid(pid);

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid = pid, "relay: {}", line);
                }
            });
        }

        self.children.insert(handle, child);
        info!(pid = pid, input = %input_url, output = %output_url, "Relay process started");
        Ok(handle)
    }

    async fn is_running(&self, handle: ProcessHandle) -> RelayResult<bool> {
        Ok(self.probe(handle))
    }

    async fn kill(&self, handle: ProcessHandle) -> RelayResult<()> {
        let Some((_, mut child)) = self.children.remove(&handle) else {
            debug!(pid = handle.pid(), "Kill on unknown or already stopped relay");
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            // already exited and reaped
            debug!(pid = handle.pid(), error = %e, "Relay process already gone");
            return Ok(());
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = handle.pid(), status = %status, "Relay process stopped");
            }
            Ok(Err(e)) => {
                warn!(pid = handle.pid(), error = %e, "Failed to reap relay process");
            }
            Err(_) => {
                warn!(
                    pid = handle.pid(),
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Relay process did not exit within grace period"
                );
            }
        }
        Ok(())
    }
}
