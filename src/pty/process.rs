//! Process backend abstraction shared by the PTY and pipe spawners.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use utoipa::ToSchema;

use super::platform::SpawnSpec;
use crate::errors::LiveResult;

/// Channel capacity for process input chunks.
pub const PROCESS_INPUT_CHANNEL_SIZE: usize = 1024;
/// Bytes read from the process per chunk.
pub const PROCESS_READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// How the OS reported the end of a process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

/// Out-of-band handle on a running process.
pub trait ProcessControl: Send + Sync {
    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&self) -> LiveResult<()>;

    /// Force the process down.
    fn kill(&self) -> LiveResult<()>;

    fn resize(&self, size: TerminalSize) -> LiveResult<()>;
}

/// A started process and the ends of its byte streams.
///
/// `output` yields chunks in the order the process wrote them and closes at
/// EOF. `exit` resolves once the OS has reaped the process.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<ProcessExit>,
    pub control: Arc<dyn ProcessControl>,
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec, size: TerminalSize) -> LiveResult<SpawnedProcess>;

    /// Whether the backend hands the process a real terminal itself, making
    /// `script` wrapping unnecessary.
    fn allocates_terminal(&self) -> bool;
}

/// Send SIGTERM, treating an already-gone process as success.
#[cfg(unix)]
pub(crate) fn send_sigterm(pid: u32) -> LiveResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| crate::errors::LiveError::Internal(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(crate::errors::LiveError::Internal(format!(
            "failed to signal pid {pid}: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_clean_zero_exit_is_success() {
        assert!(ProcessExit {
            code: Some(0),
            signal: None
        }
        .success());
        assert!(!ProcessExit {
            code: Some(1),
            signal: None
        }
        .success());
        assert!(!ProcessExit {
            code: None,
            signal: Some("SIGKILL".into())
        }
        .success());
    }

    #[cfg(unix)]
    #[test]
    fn sigterm_to_missing_process_is_ok() {
        // Above the largest pid_max the kernel allows.
        assert!(send_sigterm(999_999_999).is_ok());
    }
}
