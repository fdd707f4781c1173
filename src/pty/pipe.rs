//! Piped-stdio backend on `tokio::process`.
//!
//! The process gets no terminal of its own; the session pairs this backend
//! with a `script(1)` wrapping strategy so the remote shell still sees one.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::platform::SpawnSpec;
use super::process::{
    ProcessControl, ProcessExit, ProcessSpawner, SpawnedProcess, TerminalSize,
    PROCESS_INPUT_CHANNEL_SIZE, PROCESS_READ_BUFFER_SIZE,
};
use crate::errors::{LiveError, LiveResult};

pub struct PipeSpawner {
    output_buffer: usize,
}

impl PipeSpawner {
    pub fn new(output_buffer: usize) -> Self {
        Self {
            output_buffer: output_buffer.max(1),
        }
    }
}

impl Default for PipeSpawner {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProcessSpawner for PipeSpawner {
    fn spawn(&self, spec: &SpawnSpec, _size: TerminalSize) -> LiveResult<SpawnedProcess> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| LiveError::SpawnFailed(format!("{}: {e}", spec.program)))?;
        let pid = child.id();

        let missing = |name: &str| LiveError::SpawnFailed(format!("child {name} not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (input_tx, input_rx) = mpsc::channel(PROCESS_INPUT_CHANNEL_SIZE);
        let (output_tx, output_rx) = mpsc::channel(self.output_buffer);
        let (exit_tx, exit_rx) = oneshot::channel();
        let force_kill = CancellationToken::new();

        tokio::spawn(pump_input(stdin, input_rx));
        tokio::spawn(pump_output(stdout, output_tx.clone()));
        tokio::spawn(pump_output(stderr, output_tx));
        tokio::spawn(wait_for_exit(child, force_kill.clone(), exit_tx));

        debug!(pid = ?pid, program = %spec.program, "[pipe] process spawned");

        Ok(SpawnedProcess {
            pid,
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            control: Arc::new(PipeControl { pid, force_kill }),
        })
    }

    fn allocates_terminal(&self) -> bool {
        false
    }
}

struct PipeControl {
    pid: Option<u32>,
    force_kill: CancellationToken,
}

impl ProcessControl for PipeControl {
    fn terminate(&self) -> LiveResult<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            return super::process::send_sigterm(pid);
        }
        self.force_kill.cancel();
        Ok(())
    }

    fn kill(&self) -> LiveResult<()> {
        self.force_kill.cancel();
        Ok(())
    }

    fn resize(&self, size: TerminalSize) -> LiveResult<()> {
        debug!(pid = ?self.pid, cols = size.cols, rows = size.rows, "[pipe] resize ignored");
        Ok(())
    }
}

async fn pump_input(mut stdin: ChildStdin, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = input_rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            debug!("[pipe] stdin closed: {e}");
            return;
        }
        if let Err(e) = stdin.flush().await {
            debug!("[pipe] stdin flush failed: {e}");
            return;
        }
    }
    // Dropping stdin delivers EOF to the process.
}

async fn pump_output<R: AsyncRead + Unpin>(mut stream: R, output_tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; PROCESS_READ_BUFFER_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if output_tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("[pipe] read error: {e}");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    force_kill: CancellationToken,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = force_kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!("[pipe] kill failed: {e}");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit {
            code: status.code(),
            signal: exit_signal(&status),
        },
        Err(e) => {
            warn!("[pipe] wait failed: {e}");
            ProcessExit::default()
        }
    };
    let _ = exit_tx.send(exit);
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|sig| {
        nix::sys::signal::Signal::try_from(sig)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| sig.to_string())
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}
