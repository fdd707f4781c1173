//! Native pseudo-terminal backend on `portable-pty`.

use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::platform::SpawnSpec;
use super::process::{
    ProcessControl, ProcessExit, ProcessSpawner, SpawnedProcess, TerminalSize,
    PROCESS_INPUT_CHANNEL_SIZE, PROCESS_READ_BUFFER_SIZE,
};
use crate::errors::{LiveError, LiveResult};

const PTY_WRITE_CHUNK_SIZE: usize = 512;

pub struct NativePtySpawner {
    output_buffer: usize,
}

impl NativePtySpawner {
    pub fn new(output_buffer: usize) -> Self {
        Self {
            output_buffer: output_buffer.max(1),
        }
    }
}

impl Default for NativePtySpawner {
    fn default() -> Self {
        Self::new(256)
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl ProcessSpawner for NativePtySpawner {
    fn spawn(&self, spec: &SpawnSpec, size: TerminalSize) -> LiveResult<SpawnedProcess> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| LiveError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| LiveError::SpawnFailed(format!("{}: {e}", spec.program)))?;
        // Only the child keeps the slave open, so the master sees EOF when it exits.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| LiveError::SpawnFailed(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| LiveError::SpawnFailed(format!("failed to take PTY writer: {e}")))?;

        let label = pid.map_or_else(|| "?".to_string(), |p| p.to_string());
        let (input_tx, input_rx) = mpsc::channel(PROCESS_INPUT_CHANNEL_SIZE);
        let (output_tx, output_rx) = mpsc::channel(self.output_buffer);
        let (exit_tx, exit_rx) = oneshot::channel();

        spawn_pty_writer_thread(label.clone(), writer, input_rx);
        tokio::spawn(read_pty_output(label.clone(), reader, output_tx));
        std::thread::spawn(move || {
            let exit = match child.wait() {
                Ok(status) => exit_from_status(&status),
                Err(e) => {
                    error!("[pty:{}] wait failed: {}", label, e);
                    ProcessExit::default()
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(SpawnedProcess {
            pid,
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            control: Arc::new(NativeControl {
                pid,
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
            }),
        })
    }

    fn allocates_terminal(&self) -> bool {
        true
    }
}

/// portable-pty keeps the signal private and only exposes it through
/// `Display` ("Terminated by <description>"), reporting code 1 alongside.
fn exit_from_status(status: &portable_pty::ExitStatus) -> ProcessExit {
    let rendered = status.to_string();
    match rendered.strip_prefix("Terminated by ") {
        Some(signal) if !status.success() => ProcessExit {
            code: None,
            signal: Some(signal.to_string()),
        },
        _ => ProcessExit {
            code: i32::try_from(status.exit_code()).ok(),
            signal: None,
        },
    }
}

struct NativeControl {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl ProcessControl for NativeControl {
    fn terminate(&self) -> LiveResult<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            return super::process::send_sigterm(pid);
        }
        self.kill()
    }

    fn kill(&self) -> LiveResult<()> {
        self.killer
            .lock()
            .kill()
            .map_err(|e| LiveError::Internal(format!("failed to kill PTY process: {e}")))
    }

    fn resize(&self, size: TerminalSize) -> LiveResult<()> {
        self.master
            .lock()
            .resize(pty_size(size))
            .map_err(|e| LiveError::Internal(format!("failed to resize PTY: {e}")))
    }
}

/// Dedicated thread for PTY writes; blocking writes never stall the runtime.
fn spawn_pty_writer_thread(
    label: String,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        debug!("[writer:{}] Writer thread started", label);
        let mut total_bytes_written: usize = 0;

        while let Some(data) = input_rx.blocking_recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|()| writer.flush()) {
                    error!(
                        "[writer:{}] Write error: {} (errno: {:?})",
                        label,
                        e,
                        e.raw_os_error()
                    );
                    return;
                }
            }
            total_bytes_written += data.len();
        }

        debug!(
            "[writer:{}] Writer thread finished. Total: {} bytes",
            label, total_bytes_written
        );
    });
}

async fn read_pty_output(
    label: String,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
) {
    let mut buf = [0u8; PROCESS_READ_BUFFER_SIZE];
    let mut total_bytes_read: usize = 0;

    loop {
        let read_result = tokio::task::spawn_blocking(move || {
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await;

        let (returned_reader, returned_buf, result) = match read_result {
            Ok(r) => r,
            Err(e) => {
                error!("[reader:{}] spawn_blocking panicked: {}", label, e);
                break;
            }
        };
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) => break,
            Ok(n) => {
                total_bytes_read += n;
                if output_tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            // Linux reports EIO on the master once the child side closes.
            Err(e) => {
                debug!("[reader:{}] Read ended: {}", label, e);
                break;
            }
        }
    }

    info!(
        "[reader:{}] EOF received. Total: {} bytes",
        label, total_bytes_read
    );
}
