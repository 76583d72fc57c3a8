//! Process management traits and types

use crate::error::Result;
use async_trait::async_trait;

/// A handle to control a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to complete and return its exit status
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Send SIGTERM (or equivalent) for graceful shutdown
    async fn terminate(&mut self) -> Result<()>;

    /// Send SIGKILL (or equivalent) to forcefully stop the process
    async fn kill(&mut self) -> Result<()>;
}

/// Process exit status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }
}

/// Exit status plus the captured output of a completed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    /// How the process ended
    pub status: ExitStatus,
    /// Captured stdout, one line per event, newline terminated
    pub stdout: String,
    /// Captured stderr, one line per event, newline terminated
    pub stderr: String,
}

impl ExitResult {
    /// Returns true if the process exited with code 0
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// The most useful text to show when the command failed
    ///
    /// Docker and systemctl report errors on stderr; some tools print them on
    /// stdout instead, so fall back to that when stderr is empty.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match (self.status.code, self.status.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "exited without status".to_string(),
        }
    }
}
