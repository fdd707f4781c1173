//! Terminal session implementation
//!
//! One session owns one process. Three tasks cooperate:
//! - the supervisor waits for exit, a close request or the idle timeout and
//!   runs the single teardown sequence;
//! - the output forwarder copies process bytes to the attached client and
//!   emits the final `Ended` event;
//! - the input forwarder copies client bytes to the process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{ProcessControl, ProcessExit, SpawnedProcess};
use super::types::{
    ClientChannel, ClientInput, ExitCause, ExitInfo, SessionInfo, SessionState, TerminalEvent,
};
use crate::auth::Identity;
use crate::config::TerminalConfig;
use crate::errors::{LiveError, LiveResult};

/// How long the output forwarder keeps draining after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long teardown waits for the client to take the final frames.
const ENDED_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for the OS after a forced kill.
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub idle_timeout: Option<Duration>,
    pub kill_grace: Duration,
}

impl From<&TerminalConfig> for SessionTimings {
    fn from(config: &TerminalConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            kill_grace: config.kill_grace(),
        }
    }
}

/// A process-backed terminal bridged to at most one client channel
pub struct TerminalSession {
    pub id: String,
    pub host_ref: String,
    identity: Identity,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    exit: RwLock<Option<ExitInfo>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    /// Taken by the first `attach`.
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    control: Arc<dyn ProcessControl>,
    last_activity: Mutex<Instant>,
    close_requested: CancellationToken,
    close_cause: Mutex<Option<ExitCause>>,
    /// Fires once the exit record is stored.
    exited: CancellationToken,
    /// Fires once the session is `Closed`.
    closed: CancellationToken,
    output_forwarder: Mutex<Option<JoinHandle<()>>>,
    attached: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TerminalSession {
    pub(crate) fn new(
        id: String,
        host_ref: String,
        identity: Identity,
        process: SpawnedProcess,
    ) -> (Arc<Self>, oneshot::Receiver<ProcessExit>) {
        let SpawnedProcess {
            pid,
            input,
            output,
            exit,
            control,
        } = process;

        let session = Arc::new(Self {
            id,
            host_ref,
            identity,
            pid,
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Initializing),
            exit: RwLock::new(None),
            input_tx: input,
            output_rx: Mutex::new(Some(output)),
            control,
            last_activity: Mutex::new(Instant::now()),
            close_requested: CancellationToken::new(),
            close_cause: Mutex::new(None),
            exited: CancellationToken::new(),
            closed: CancellationToken::new(),
            output_forwarder: Mutex::new(None),
            attached: AtomicBool::new(false),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });
        (session, exit)
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.read().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Relaxed)
    }

    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            host_ref: self.host_ref.clone(),
            user_id: self.identity.user_id.clone(),
            state: self.state(),
            pid: self.pid,
            created_at: self.created_at,
            idle_secs: self.last_activity.lock().elapsed().as_secs(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            attached: self.is_attached(),
            exit: self.exit_info(),
        }
    }

    /// Move forward to `next`; never backwards.
    fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.write();
        if next > *state {
            debug!("[session:{}] {:?} -> {:?}", self.id, *state, next);
            *state = next;
            true
        } else {
            false
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Ask for teardown. Only the first request's cause is kept; returns
    /// whether this call was the first.
    pub fn request_close(&self, cause: ExitCause) -> bool {
        let first = {
            let mut current = self.close_cause.lock();
            if current.is_none() && !self.exited.is_cancelled() {
                *current = Some(cause);
                true
            } else {
                false
            }
        };
        self.close_requested.cancel();
        first
    }

    /// Resolves once the session is `Closed`.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Bind a client channel. Fails if one was already bound.
    pub fn attach(self: &Arc<Self>, channel: ClientChannel) -> LiveResult<()> {
        if self.state() >= SessionState::Closing {
            return Err(LiveError::NotFound(format!("session {} is closing", self.id)));
        }
        let output = self
            .output_rx
            .lock()
            .take()
            .ok_or_else(|| LiveError::AlreadyAttached(self.id.clone()))?;
        self.attached.store(true, Ordering::Relaxed);

        let forwarder = tokio::spawn(forward_output(Arc::clone(self), output, channel.output));
        *self.output_forwarder.lock() = Some(forwarder);
        tokio::spawn(forward_input(Arc::clone(self), channel.input));

        info!("[session:{}] Client attached", self.id);
        Ok(())
    }

    /// Drive the session to `Closed` and return its exit record.
    pub(crate) async fn supervise(
        self: Arc<Self>,
        mut exit_rx: oneshot::Receiver<ProcessExit>,
        timings: SessionTimings,
    ) -> ExitInfo {
        self.advance(SessionState::Active);

        let (process_exit, cause) = loop {
            let idle_deadline = timings
                .idle_timeout
                .map(|limit| *self.last_activity.lock() + limit);

            tokio::select! {
                result = &mut exit_rx => {
                    break (result.unwrap_or_default(), ExitCause::ProcessExited);
                }
                () = self.close_requested.cancelled() => {
                    let cause = self.close_cause.lock().unwrap_or(ExitCause::Closed);
                    let exit = self.terminate_process(&mut exit_rx, timings.kill_grace).await;
                    break (exit, cause);
                }
                () = sleep_until(idle_deadline) => {
                    let still_idle = timings
                        .idle_timeout
                        .is_some_and(|limit| self.last_activity.lock().elapsed() >= limit);
                    if still_idle {
                        info!("[session:{}] Idle timeout reached", self.id);
                        self.request_close(ExitCause::IdleTimeout);
                    }
                }
            }
        };

        let exit = ExitInfo {
            exit_code: process_exit.code,
            signal: process_exit.signal,
            cause,
        };
        *self.exit.write() = Some(exit.clone());
        self.exited.cancel();

        if let Some(err) = exit.crash_error() {
            warn!(code = err.code(), "[session:{}] {}", self.id, err);
        }

        let forwarder = self.output_forwarder.lock().take();
        if let Some(handle) = forwarder {
            if time::timeout(ENDED_FLUSH_TIMEOUT, handle).await.is_err() {
                debug!("[session:{}] Client did not take final frames", self.id);
            }
        }

        self.advance(SessionState::Closed);
        self.closed.cancel();
        info!(
            "[session:{}] Closed ({:?}, in: {} bytes, out: {} bytes)",
            self.id,
            exit.cause,
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed)
        );
        exit
    }

    /// SIGTERM, wait out the grace period, then kill.
    async fn terminate_process(
        &self,
        exit_rx: &mut oneshot::Receiver<ProcessExit>,
        grace: Duration,
    ) -> ProcessExit {
        self.advance(SessionState::Closing);
        if let Err(e) = self.control.terminate() {
            warn!("[session:{}] Terminate failed: {}", self.id, e);
        }

        match time::timeout(grace, &mut *exit_rx).await {
            Ok(result) => result.unwrap_or_default(),
            Err(_) => {
                warn!(
                    "[session:{}] Process ignored SIGTERM for {:?}, killing",
                    self.id, grace
                );
                if let Err(e) = self.control.kill() {
                    warn!("[session:{}] Kill failed: {}", self.id, e);
                }
                match time::timeout(KILL_WAIT_TIMEOUT, exit_rx).await {
                    Ok(result) => result.unwrap_or_default(),
                    Err(_) => {
                        warn!("[session:{}] Process did not die after kill", self.id);
                        ProcessExit::default()
                    }
                }
            }
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        if self.exit.get_mut().is_none() {
            let _ = self.control.kill();
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Process → client, then exactly one `Ended`.
async fn forward_output(
    session: Arc<TerminalSession>,
    mut output: mpsc::Receiver<Vec<u8>>,
    client: mpsc::Sender<TerminalEvent>,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            chunk = output.recv() => chunk,
            () = session.exited.cancelled() => {
                drain_output(&session, &mut output, &client).await;
                break;
            }
        };
        let Some(bytes) = chunk else {
            break;
        };
        session.touch();
        session
            .bytes_out
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if client.send(TerminalEvent::Output(bytes)).await.is_err() {
            session.request_close(ExitCause::ClientDisconnected);
            return;
        }
    }

    session.exited.cancelled().await;
    if let Some(exit) = session.exit_info() {
        let _ = client.send(TerminalEvent::Ended(exit)).await;
    }
}

/// Forward whatever the process wrote before it exited.
async fn drain_output(
    session: &TerminalSession,
    output: &mut mpsc::Receiver<Vec<u8>>,
    client: &mpsc::Sender<TerminalEvent>,
) {
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    while let Ok(Some(bytes)) = time::timeout_at(deadline, output.recv()).await {
        session
            .bytes_out
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if client.send(TerminalEvent::Output(bytes)).await.is_err() {
            return;
        }
    }
}

/// Client → process, in arrival order.
async fn forward_input(session: Arc<TerminalSession>, mut input: mpsc::Receiver<ClientInput>) {
    loop {
        let message = tokio::select! {
            message = input.recv() => message,
            () = session.exited.cancelled() => return,
        };
        match message {
            Some(ClientInput::Data(bytes)) => {
                if session.state() != SessionState::Active {
                    continue;
                }
                session.touch();
                let len = bytes.len() as u64;
                if session.input_tx.send(bytes).await.is_err() {
                    debug!("[session:{}] Process input closed", session.id);
                    return;
                }
                session.bytes_in.fetch_add(len, Ordering::Relaxed);
            }
            Some(ClientInput::Resize(size)) => {
                if let Err(e) = session.control.resize(size) {
                    warn!("[session:{}] Resize failed: {}", session.id, e);
                }
            }
            Some(ClientInput::Close) => {
                session.request_close(ExitCause::Closed);
                return;
            }
            None => {
                info!("[session:{}] Client disconnected", session.id);
                session.request_close(ExitCause::ClientDisconnected);
                return;
            }
        }
    }
}
