//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::info;

use crate::auth::TokenValidator;
use crate::config::{LiveConfig, TerminalBackend};
use crate::events::EventBus;
use crate::hub::{BroadcastHub, HubPolicy};
use crate::pty::{NativePtySpawner, PipeSpawner, ProcessSpawner, SessionRegistry, StaticHostResolver};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub sessions: Arc<SessionRegistry>,
    pub validator: Arc<dyn TokenValidator>,
    pub bus: EventBus,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        hub: Arc<BroadcastHub>,
        sessions: Arc<SessionRegistry>,
        validator: Arc<dyn TokenValidator>,
        bus: EventBus,
    ) -> Self {
        Self {
            hub,
            sessions,
            validator,
            bus,
            started_at: Instant::now(),
        }
    }

    /// Wire the bus, hub and session registry from configuration.
    pub fn from_config(config: &LiveConfig, validator: Arc<dyn TokenValidator>) -> Result<Self> {
        let bus = EventBus::new(config.hub.bus_capacity);
        let hub = BroadcastHub::new(HubPolicy::from(&config.hub));

        let resolver = StaticHostResolver::new(
            config.resolved_hosts()?,
            config.terminal.probe_timeout(),
        );
        let mut host_refs: Vec<&str> = resolver.host_refs().collect();
        host_refs.sort_unstable();
        info!(hosts = ?host_refs, "Terminal hosts loaded");
        let spawner: Arc<dyn ProcessSpawner> = match config.terminal.backend {
            TerminalBackend::Pty => Arc::new(NativePtySpawner::new(config.terminal.output_buffer)),
            TerminalBackend::Pipe => Arc::new(PipeSpawner::new(config.terminal.output_buffer)),
        };
        let sessions = SessionRegistry::new(
            validator.clone(),
            Arc::new(resolver),
            spawner,
            config.terminal.clone(),
            Some(bus.clone()),
        );

        Ok(Self::new(hub, sessions, validator, bus))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
