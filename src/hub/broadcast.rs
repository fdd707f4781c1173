//! Broadcast hub: connection registry, fan-out, keepalive and back-pressure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ConnectionId, Delivery, PushConnection};
use super::frame::{CloseReason, Frame};
use super::transport::PushTransport;
use crate::auth::Identity;
use crate::config::HubConfig;
use crate::errors::{LiveError, LiveResult};
use crate::events::{Event, EventBus};

/// Which event types a connection receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    All,
    Types(HashSet<String>),
}

impl Subscription {
    /// Parse a comma-separated `types` list. Empty or missing means everything.
    pub fn from_query(types: Option<&str>) -> Self {
        let types: HashSet<String> = types
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if types.is_empty() {
            Subscription::All
        } else {
            Subscription::Types(types)
        }
    }
}

/// Back-pressure and liveness policy applied to every connection.
#[derive(Debug, Clone)]
pub struct HubPolicy {
    pub buffer_capacity: usize,
    pub critical_event_types: HashSet<String>,
    pub keepalive_interval: Duration,
    pub flush_grace: Duration,
}

impl From<&HubConfig> for HubPolicy {
    fn from(config: &HubConfig) -> Self {
        Self {
            buffer_capacity: config.buffer_capacity,
            critical_event_types: config.critical_event_types.clone(),
            keepalive_interval: config.keepalive_interval(),
            flush_grace: config.flush_grace(),
        }
    }
}

impl Default for HubPolicy {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

struct Entry {
    conn: Arc<PushConnection>,
    subscription: Subscription,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Entry>,
    by_type: HashMap<String, HashSet<ConnectionId>>,
    wildcard: HashSet<ConnectionId>,
}

impl Registry {
    fn insert(&mut self, conn: Arc<PushConnection>, subscription: Subscription) {
        let id = conn.id().to_string();
        match &subscription {
            Subscription::All => {
                self.wildcard.insert(id.clone());
            }
            Subscription::Types(types) => {
                for event_type in types {
                    self.by_type
                        .entry(event_type.clone())
                        .or_default()
                        .insert(id.clone());
                }
            }
        }
        self.connections.insert(id, Entry { conn, subscription });
    }

    fn remove(&mut self, id: &str) -> Option<Arc<PushConnection>> {
        let entry = self.connections.remove(id)?;
        match &entry.subscription {
            Subscription::All => {
                self.wildcard.remove(id);
            }
            Subscription::Types(types) => {
                for event_type in types {
                    if let Some(ids) = self.by_type.get_mut(event_type) {
                        ids.remove(id);
                        if ids.is_empty() {
                            self.by_type.remove(event_type);
                        }
                    }
                }
            }
        }
        Some(entry.conn)
    }

    /// Wildcard subscribers plus those subscribed to `event_type`. A
    /// connection is in exactly one of the two sets.
    fn recipients<'a>(&'a self, event_type: &str) -> impl Iterator<Item = &'a Arc<PushConnection>> {
        self.wildcard
            .iter()
            .chain(self.by_type.get(event_type).into_iter().flatten())
            .filter_map(|id| self.connections.get(id).map(|entry| &entry.conn))
    }
}

/// Owns every live push connection.
pub struct BroadcastHub {
    registry: RwLock<Registry>,
    /// Serializes fan-out so every connection sees publishes in one order.
    sequence: Mutex<u64>,
    policy: HubPolicy,
    shutdown: CancellationToken,
    writers: TaskTracker,
}

impl BroadcastHub {
    pub fn new(policy: HubPolicy) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry::default()),
            sequence: Mutex::new(0),
            policy,
            shutdown: CancellationToken::new(),
            writers: TaskTracker::new(),
        })
    }

    pub fn policy(&self) -> &HubPolicy {
        &self.policy
    }

    pub fn connection_count(&self) -> usize {
        self.registry.read().connections.len()
    }

    pub fn connection(&self, id: &str) -> Option<Arc<PushConnection>> {
        self.registry
            .read()
            .connections
            .get(id)
            .map(|entry| entry.conn.clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Register an already-validated identity and start its writer task.
    pub fn register<T: PushTransport>(
        self: &Arc<Self>,
        identity: Identity,
        transport: T,
        subscription: Subscription,
    ) -> LiveResult<ConnectionId> {
        if self.is_shutting_down() {
            return Err(LiveError::Internal("hub is shutting down".into()));
        }
        if identity.is_expired(Utc::now()) {
            return Err(LiveError::AuthFailed("token expired".into()));
        }

        let id = Uuid::new_v4().to_string();
        let conn = Arc::new(PushConnection::new(
            id.clone(),
            identity,
            self.policy.buffer_capacity,
        ));
        conn.open();

        self.registry.write().insert(conn.clone(), subscription);

        info!(
            conn_id = %id,
            user_id = %conn.identity().user_id,
            "[hub] connection registered"
        );

        let hub = Arc::clone(self);
        self.writers.spawn(run_writer(hub, conn, transport));
        Ok(id)
    }

    /// Remove a connection and begin its teardown. No-op for unknown ids.
    pub fn unregister(&self, id: &str, reason: CloseReason) -> bool {
        // Remove before closing so a Closed connection is never registered.
        let Some(conn) = self.registry.write().remove(id) else {
            return false;
        };
        conn.close(reason);

        let lifetime = Utc::now() - conn.created_at();
        match reason {
            CloseReason::TransportClosed | CloseReason::Unregistered => debug!(
                conn_id = %id,
                reason = %reason,
                lifetime_secs = lifetime.num_seconds(),
                "[hub] connection closed"
            ),
            _ => info!(
                conn_id = %id,
                reason = %reason,
                dropped = conn.dropped_count(),
                delivered = conn.delivered_count(),
                lifetime_secs = lifetime.num_seconds(),
                "[hub] connection closed"
            ),
        }
        true
    }

    /// Fan an event out to every subscribed connection. Never blocks on a
    /// client; returns how many connections accepted the frame.
    pub fn publish(&self, event: &Event) -> usize {
        let data: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(event_type = %event.event_type, "[hub] failed to serialize event: {e}");
                return 0;
            }
        };
        let critical = self
            .policy
            .critical_event_types
            .contains(&event.event_type);
        let now = Utc::now();

        let mut accepted = 0;
        let mut expired = Vec::new();
        let mut overflowed = Vec::new();
        {
            let mut sequence = self.sequence.lock();
            *sequence += 1;
            let seq = *sequence;

            let registry = self.registry.read();
            for conn in registry.recipients(&event.event_type) {
                if conn.identity().is_expired(now) {
                    expired.push(conn.id().to_string());
                    continue;
                }
                let frame = Frame::Event {
                    seq,
                    event_type: event.event_type.clone(),
                    data: data.clone(),
                };
                match conn.send(frame, critical) {
                    Delivery::Queued => accepted += 1,
                    Delivery::DroppedOldest => {
                        accepted += 1;
                        debug!(conn_id = %conn.id(), "[hub] buffer full, dropped oldest event");
                    }
                    Delivery::Overflow => overflowed.push(conn.id().to_string()),
                    Delivery::NotOpen => {}
                }
            }
        }

        for id in expired {
            self.unregister(&id, CloseReason::Expired);
        }
        for id in overflowed {
            let err = LiveError::Overflow(id.clone());
            warn!(code = err.code(), event_type = %event.event_type, "[hub] {err}");
            self.unregister(&id, CloseReason::Overflow);
        }
        accepted
    }

    /// The bus skipped events before they reached `publish`. Any of them may
    /// have been critical, so when critical types are configured every
    /// connection is closed with `overflow` and left to reconnect.
    fn bus_lagged(&self) {
        if self.policy.critical_event_types.is_empty() {
            return;
        }
        let ids: Vec<ConnectionId> = self.registry.read().connections.keys().cloned().collect();
        for id in ids {
            let err = LiveError::Overflow(id.clone());
            warn!(code = err.code(), "[hub] {err} after bus lag");
            self.unregister(&id, CloseReason::Overflow);
        }
    }

    /// One liveness pass: expire, reap stalled connections, queue keepalives.
    pub fn sweep(&self) {
        let now = Utc::now();
        let grace = self.policy.flush_grace;
        let mut expired = Vec::new();
        let mut stalled = Vec::new();
        {
            let registry = self.registry.read();
            for (id, entry) in &registry.connections {
                if entry.conn.identity().is_expired(now) {
                    expired.push(id.clone());
                } else if entry.conn.is_stalled(grace) {
                    stalled.push(id.clone());
                } else {
                    entry.conn.send_keepalive();
                }
            }
        }

        for id in expired {
            self.unregister(&id, CloseReason::Expired);
        }
        for id in stalled {
            warn!(conn_id = %id, "[hub] connection failed to flush within grace period");
            self.unregister(&id, CloseReason::Stalled);
        }
    }

    /// Run [`sweep`](Self::sweep) on the keepalive interval until shutdown.
    pub fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(hub.policy.keepalive_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => hub.sweep(),
                    () = hub.shutdown.cancelled() => break,
                }
            }
            debug!("[hub] keepalive loop stopped");
        })
    }

    /// Forward everything published on `bus` into this hub until shutdown.
    pub fn spawn_bus_pump(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            hub.publish(&event);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "[hub] event bus lagged, events skipped");
                            hub.bus_lagged();
                        }
                        Err(RecvError::Closed) => break,
                    },
                    () = hub.shutdown.cancelled() => break,
                }
            }
            debug!("[hub] bus pump stopped");
        })
    }

    /// Close every connection with a `server-shutdown` frame and wait, up to
    /// the flush grace, for the writers to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<ConnectionId> = self.registry.read().connections.keys().cloned().collect();
        info!(connections = ids.len(), "[hub] shutting down");
        for id in ids {
            self.unregister(&id, CloseReason::Shutdown);
        }

        self.writers.close();
        if time::timeout(self.policy.flush_grace, self.writers.wait())
            .await
            .is_err()
        {
            warn!("[hub] writers did not finish within {:?}", self.policy.flush_grace);
        }
    }
}

/// Drain one connection into its transport.
async fn run_writer<T: PushTransport>(
    hub: Arc<BroadcastHub>,
    conn: Arc<PushConnection>,
    mut transport: T,
) {
    let grace = hub.policy.flush_grace;
    let cancelled = conn.cancellation();
    let mut exit = None;

    loop {
        let next = tokio::select! {
            frame = conn.next_frame() => frame,
            () = transport.closed() => {
                exit = Some(CloseReason::TransportClosed);
                break;
            }
        };
        let Some(frame) = next else {
            break;
        };

        let was_event = frame.is_event();
        let written = tokio::select! {
            result = time::timeout(grace, transport.write_frame(frame)) => result,
            () = cancelled.cancelled() => break,
        };
        match written {
            Ok(Ok(())) => conn.mark_flushed(was_event),
            Ok(Err(_)) => {
                exit = Some(CloseReason::TransportClosed);
                break;
            }
            Err(_) => {
                exit = Some(CloseReason::Stalled);
                break;
            }
        }
    }

    transport.shutdown().await;
    if let Some(reason) = exit {
        hub.unregister(conn.id(), reason);
    }
    debug!(conn_id = %conn.id(), "[hub] writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::STATUS_CHANGED;
    use crate::hub::connection::ConnectionState;
    use crate::hub::transport::ChannelTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::{mpsc, Semaphore};

    fn policy(capacity: usize) -> HubPolicy {
        HubPolicy {
            buffer_capacity: capacity,
            critical_event_types: HashSet::from(["audit-entry-created".to_string()]),
            keepalive_interval: Duration::from_secs(30),
            flush_grace: Duration::from_secs(10),
        }
    }

    fn status_event(i: u64) -> Event {
        Event::new(STATUS_CHANGED, json!({ "i": i }), "test")
    }

    async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame in time")
            .expect("stream open")
    }

    async fn recv_event(rx: &mut mpsc::Receiver<Frame>) -> (String, serde_json::Value) {
        loop {
            match recv(rx).await {
                Frame::Event {
                    event_type, data, ..
                } => return (event_type, serde_json::from_str(&data).unwrap()),
                Frame::Connected { .. } | Frame::Keepalive => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Transport whose writes wait for permits, signalling each attempt.
    struct GatedTransport {
        permits: Arc<Semaphore>,
        attempts: mpsc::UnboundedSender<()>,
        out: mpsc::UnboundedSender<Frame>,
    }

    #[async_trait]
    impl PushTransport for GatedTransport {
        async fn write_frame(&mut self, frame: Frame) -> LiveResult<()> {
            let _ = self.attempts.send(());
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| LiveError::TransportClosed)?;
            permit.forget();
            self.out.send(frame).map_err(|_| LiveError::TransportClosed)
        }

        async fn closed(&self) {
            self.out.closed().await;
        }

        async fn shutdown(&mut self) {}
    }

    #[tokio::test]
    async fn publish_with_no_connections_is_a_noop() {
        let hub = BroadcastHub::new(policy(8));
        for i in 0..100 {
            assert_eq!(hub.publish(&status_event(i)), 0);
        }
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn three_connections_each_get_the_status_event() {
        let hub = BroadcastHub::new(policy(8));
        let mut receivers = Vec::new();
        for n in 0..3 {
            let (transport, rx) = ChannelTransport::pair(8);
            hub.register(Identity::new(format!("u{n}")), transport, Subscription::All)
                .unwrap();
            receivers.push(rx);
        }

        let event = Event::new(STATUS_CHANGED, json!({"hostRef": "h1", "status": "up"}), "test");
        assert_eq!(hub.publish(&event), 3);

        for rx in &mut receivers {
            let (event_type, body) = recv_event(rx).await;
            assert_eq!(event_type, "status-changed");
            assert_eq!(body["type"], "status-changed");
            assert_eq!(body["payload"], json!({"hostRef": "h1", "status": "up"}));
        }
    }

    #[tokio::test]
    async fn per_connection_order_matches_publish_order() {
        let hub = BroadcastHub::new(policy(256));
        let (transport, mut rx) = ChannelTransport::pair(4);
        hub.register(Identity::new("u"), transport, Subscription::All)
            .unwrap();

        for i in 0..200 {
            hub.publish(&status_event(i));
        }
        for i in 0..200 {
            let (_, body) = recv_event(&mut rx).await;
            assert_eq!(body["payload"]["i"], i);
        }
    }

    #[tokio::test]
    async fn typed_subscription_filters_events() {
        let hub = BroadcastHub::new(policy(8));
        let (transport, mut rx) = ChannelTransport::pair(8);
        hub.register(
            Identity::new("u"),
            transport,
            Subscription::from_query(Some("user-state-changed, audit-entry-created")),
        )
        .unwrap();

        assert_eq!(hub.publish(&status_event(1)), 0);
        assert_eq!(
            hub.publish(&Event::new("user-state-changed", json!({"id": 1}), "t")),
            1
        );
        let (event_type, _) = recv_event(&mut rx).await;
        assert_eq!(event_type, "user-state-changed");
    }

    #[tokio::test]
    async fn slow_client_keeps_newest_events() {
        let hub = BroadcastHub::new(policy(10));
        let permits = Arc::new(Semaphore::new(0));
        let (attempt_tx, mut attempts) = mpsc::unbounded_channel();
        let (out_tx, mut out) = mpsc::unbounded_channel();
        let id = hub
            .register(
                Identity::new("slow"),
                GatedTransport {
                    permits: permits.clone(),
                    attempts: attempt_tx,
                    out: out_tx,
                },
                Subscription::All,
            )
            .unwrap();

        // Writer is now holding the connected frame, buffer is empty.
        attempts.recv().await.unwrap();
        for i in 0..15 {
            hub.publish(&status_event(i));
        }
        let conn = hub.connection(&id).unwrap();
        assert_eq!(conn.dropped_count(), 5);

        permits.add_permits(11);
        assert!(matches!(out.recv().await, Some(Frame::Connected { .. })));
        let mut seen = Vec::new();
        for _ in 0..10 {
            match out.recv().await {
                Some(Frame::Event { data, .. }) => {
                    let body: serde_json::Value = serde_json::from_str(&data).unwrap();
                    seen.push(body["payload"]["i"].as_u64().unwrap());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, (5..15).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn critical_overflow_closes_only_that_connection() {
        let hub = BroadcastHub::new(policy(2));
        let permits = Arc::new(Semaphore::new(0));
        let (attempt_tx, mut attempts) = mpsc::unbounded_channel();
        let (out_tx, _out) = mpsc::unbounded_channel();
        let slow = hub
            .register(
                Identity::new("slow"),
                GatedTransport {
                    permits,
                    attempts: attempt_tx,
                    out: out_tx,
                },
                Subscription::All,
            )
            .unwrap();
        let (transport, mut fast_rx) = ChannelTransport::pair(16);
        hub.register(Identity::new("fast"), transport, Subscription::All)
            .unwrap();
        attempts.recv().await.unwrap();
        let conn = hub.connection(&slow).unwrap();

        let audit = |i: u64| Event::new("audit-entry-created", json!({ "i": i }), "crud");
        for i in 0..3 {
            hub.publish(&audit(i));
            // Keep the fast client's buffer empty between publishes.
            let (_, body) = recv_event(&mut fast_rx).await;
            assert_eq!(body["payload"]["i"], i);
        }

        assert!(hub.connection(&slow).is_none());
        assert_eq!(conn.close_reason(), Some(CloseReason::Overflow));
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn expired_identity_gets_session_expired_frame() {
        let hub = BroadcastHub::new(policy(8));
        let (transport, mut rx) = ChannelTransport::pair(8);
        let identity =
            Identity::new("u").with_expiry(Utc::now() + chrono::Duration::milliseconds(50));
        hub.register(identity, transport, Subscription::All).unwrap();
        assert!(matches!(recv(&mut rx).await, Frame::Connected { .. }));

        time::sleep(Duration::from_millis(80)).await;
        hub.sweep();

        assert_eq!(
            recv(&mut rx).await,
            Frame::Closing {
                reason: CloseReason::Expired
            }
        );
        assert_eq!(
            time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap(),
            None
        );
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn expired_identity_is_refused_at_register() {
        let hub = BroadcastHub::new(policy(8));
        let (transport, _rx) = ChannelTransport::pair(8);
        let identity = Identity::new("u").with_expiry(Utc::now() - chrono::Duration::seconds(1));
        let result = hub.register(identity, transport, Subscription::All);
        assert!(matches!(result, Err(LiveError::AuthFailed(_))));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn client_disconnect_unregisters() {
        let hub = BroadcastHub::new(policy(8));
        let (transport, rx) = ChannelTransport::pair(8);
        let id = hub
            .register(Identity::new("u"), transport, Subscription::All)
            .unwrap();
        let conn = hub.connection(&id).unwrap();
        drop(rx);

        time::timeout(Duration::from_secs(2), conn.cancellation().cancelled())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(hub.connection_count(), 0);
        assert!(!hub.unregister(&id, CloseReason::Unregistered));
    }

    #[tokio::test]
    async fn sweep_queues_keepalive_for_idle_connections() {
        let hub = BroadcastHub::new(policy(8));
        let (transport, mut rx) = ChannelTransport::pair(8);
        hub.register(Identity::new("u"), transport, Subscription::All)
            .unwrap();
        assert!(matches!(recv(&mut rx).await, Frame::Connected { .. }));

        // Let the writer record the flush before sweeping.
        time::sleep(Duration::from_millis(20)).await;
        hub.sweep();
        assert_eq!(recv(&mut rx).await, Frame::Keepalive);
    }

    #[tokio::test]
    async fn shutdown_sends_final_frame_and_ends_streams() {
        let hub = BroadcastHub::new(policy(8));
        let (transport, mut rx) = ChannelTransport::pair(8);
        hub.register(Identity::new("u"), transport, Subscription::All)
            .unwrap();

        hub.shutdown().await;
        assert!(matches!(recv(&mut rx).await, Frame::Connected { .. }));
        assert_eq!(
            recv(&mut rx).await,
            Frame::Closing {
                reason: CloseReason::Shutdown
            }
        );
        assert_eq!(rx.recv().await, None);
        assert_eq!(hub.connection_count(), 0);

        let (transport, _rx) = ChannelTransport::pair(8);
        assert!(hub
            .register(Identity::new("late"), transport, Subscription::All)
            .is_err());
    }

    #[tokio::test]
    async fn bus_pump_forwards_published_events() {
        let hub = BroadcastHub::new(policy(8));
        let bus = EventBus::new(16);
        let pump = hub.spawn_bus_pump(&bus);
        let (transport, mut rx) = ChannelTransport::pair(8);
        hub.register(Identity::new("u"), transport, Subscription::All)
            .unwrap();

        bus.publish(status_event(7));
        let (_, body) = recv_event(&mut rx).await;
        assert_eq!(body["payload"]["i"], 7);

        hub.shutdown().await;
        time::timeout(Duration::from_secs(2), pump).await.unwrap().unwrap();
    }

    fn audit_event(i: u64) -> Event {
        Event::new("audit-entry-created", json!({ "entry": i }), "test")
    }

    #[tokio::test]
    async fn bus_lag_closes_connections_when_critical_types_exist() {
        let hub = BroadcastHub::new(policy(64));
        let bus = EventBus::new(2);
        let _pump = hub.spawn_bus_pump(&bus);
        let (transport, mut rx) = ChannelTransport::pair(64);
        let id = hub
            .register(Identity::new("u"), transport, Subscription::All)
            .unwrap();
        let conn = hub.connection(&id).unwrap();

        // Back to back on a current-thread runtime: the pump cannot keep up.
        for i in 0..6 {
            bus.publish(audit_event(i));
        }

        let mut events = 0;
        let mut closing = None;
        while let Ok(Some(frame)) = time::timeout(Duration::from_secs(2), rx.recv()).await {
            match frame {
                Frame::Event { .. } => events += 1,
                Frame::Closing { reason } => closing = Some(reason),
                _ => {}
            }
        }

        assert!(events < 6, "the bus should have lagged");
        assert_eq!(closing, Some(CloseReason::Overflow));
        assert_eq!(conn.close_reason(), Some(CloseReason::Overflow));
        assert!(hub.connection(&id).is_none());
    }

    #[tokio::test]
    async fn bus_lag_without_critical_types_keeps_connections() {
        let hub = BroadcastHub::new(HubPolicy {
            critical_event_types: HashSet::new(),
            ..policy(64)
        });
        let bus = EventBus::new(2);
        let _pump = hub.spawn_bus_pump(&bus);
        let (transport, mut rx) = ChannelTransport::pair(64);
        hub.register(Identity::new("u"), transport, Subscription::All)
            .unwrap();

        for i in 0..6 {
            bus.publish(status_event(i));
        }

        // Only the newest two survive the lag.
        let (_, first) = recv_event(&mut rx).await;
        let (_, second) = recv_event(&mut rx).await;
        assert_eq!(first["payload"]["i"], 4);
        assert_eq!(second["payload"]["i"], 5);
        assert_eq!(hub.connection_count(), 1);
    }
}
