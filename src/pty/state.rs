//! Terminal session registry
//!
//! Owns every live session and is the only place sessions are inserted or
//! removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use super::host::HostResolver;
use super::platform::StrategyTable;
use super::process::{ProcessSpawner, TerminalSize};
use super::session::{SessionTimings, TerminalSession};
use super::types::{ClientChannel, ExitCause, ExitInfo, SessionInfo};
use crate::auth::TokenValidator;
use crate::config::TerminalConfig;
use crate::errors::{LiveError, LiveResult};
use crate::events::{Event, EventBus, TERMINAL_SESSION_CLOSED, TERMINAL_SESSION_OPENED};

const EVENT_ORIGIN: &str = "terminal";

/// Shared terminal session state
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
    validator: Arc<dyn TokenValidator>,
    resolver: Arc<dyn HostResolver>,
    spawner: Arc<dyn ProcessSpawner>,
    strategies: StrategyTable,
    config: TerminalConfig,
    events: Option<EventBus>,
    supervisors: TaskTracker,
    shutting_down: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        resolver: Arc<dyn HostResolver>,
        spawner: Arc<dyn ProcessSpawner>,
        config: TerminalConfig,
        events: Option<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            validator,
            resolver,
            spawner,
            strategies: StrategyTable::standard(),
            config,
            events,
            supervisors: TaskTracker::new(),
            shutting_down: CancellationToken::new(),
        })
    }

    /// Upper bound on how long one session takes to tear down.
    fn close_bound(&self) -> Duration {
        self.config.kill_grace() + Duration::from_secs(10)
    }

    /// Authenticate, resolve the host, wrap and spawn. Returns the session id.
    ///
    /// Nothing is spawned unless the token verifies.
    pub async fn open(self: &Arc<Self>, host_ref: &str, token: &str) -> LiveResult<String> {
        self.ensure_accepting()?;
        let identity = self.validator.verify(token)?;
        let target = self.resolver.resolve(host_ref).await?;

        let strategy = if self.spawner.allocates_terminal() {
            self.strategies.passthrough()
        } else {
            self.strategies.resolve(target.platform)
        };
        let mut spec = strategy.wrap(&target.command, &target.args, &target.env);
        spec.cwd = target.cwd.clone();

        let size = TerminalSize {
            cols: self.config.cols,
            rows: self.config.rows,
        };
        let process = self.spawner.spawn(&spec, size)?;

        let session_id = Uuid::new_v4().to_string();
        let pid = process.pid;
        let (session, exit_rx) =
            TerminalSession::new(session_id.clone(), host_ref.to_string(), identity, process);

        {
            let mut sessions = self.sessions.write();
            // Dropping the session kills the process it just spawned.
            self.ensure_accepting()?;
            if sessions.contains_key(&session_id) {
                return Err(LiveError::Internal(format!(
                    "duplicate session id {session_id}"
                )));
            }
            sessions.insert(session_id.clone(), session.clone());
        }

        info!(
            "[terminal] Session opened: {} (host: {}, pid: {:?}, strategy: {}, user: {})",
            session_id,
            host_ref,
            pid,
            strategy.name(),
            session.identity().user_id
        );
        self.publish(
            TERMINAL_SESSION_OPENED,
            json!({
                "sessionId": session_id,
                "hostRef": host_ref,
                "userId": session.identity().user_id,
            }),
        );

        let registry = Arc::clone(self);
        let timings = SessionTimings::from(&self.config);
        self.supervisors.spawn(async move {
            let exit = session.clone().supervise(exit_rx, timings).await;
            registry.finish(&session, &exit);
        });

        Ok(session_id)
    }

    /// Bind the client channel to a session.
    pub fn attach(&self, session_id: &str, channel: ClientChannel) -> LiveResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| LiveError::NotFound(format!("session {session_id}")))?;
        session.attach(channel)
    }

    /// Close a session and wait for its process to be gone.
    ///
    /// Returns `false` if the session was unknown or already closing.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        let first = session.request_close(ExitCause::Closed);
        if time::timeout(self.close_bound(), session.wait_closed())
            .await
            .is_err()
        {
            warn!("[terminal] Session {} did not close in time", session_id);
        }
        self.sessions.write().remove(session_id);
        first
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Snapshot of live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .map(|session| session.to_info())
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Close every session and wait, bounded, for their supervisors.
    pub async fn shutdown_all(&self) {
        {
            // Taken with the map lock so no `open` inserts after this point.
            let _sessions = self.sessions.write();
            self.shutting_down.cancel();
        }
        let sessions: Vec<Arc<TerminalSession>> =
            self.sessions.read().values().cloned().collect();
        info!("[terminal] Shutting down {} sessions", sessions.len());
        for session in &sessions {
            session.request_close(ExitCause::Shutdown);
        }

        self.supervisors.close();
        if time::timeout(self.close_bound(), self.supervisors.wait())
            .await
            .is_err()
        {
            warn!("[terminal] Some sessions did not close during shutdown");
        }
    }

    fn finish(&self, session: &TerminalSession, exit: &ExitInfo) {
        self.sessions.write().remove(&session.id);
        self.publish(
            TERMINAL_SESSION_CLOSED,
            json!({
                "sessionId": session.id,
                "hostRef": session.host_ref,
                "exitCode": exit.exit_code,
                "signal": exit.signal,
                "cause": exit.cause,
            }),
        );
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.is_cancelled()
    }

    fn ensure_accepting(&self) -> LiveResult<()> {
        if self.is_shutting_down() {
            return Err(LiveError::Internal(
                "terminal sessions are shutting down".into(),
            ));
        }
        Ok(())
    }

    fn publish(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.events {
            bus.publish(Event::new(event_type, payload, EVENT_ORIGIN));
        }
    }
}
