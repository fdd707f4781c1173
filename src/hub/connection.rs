//! One outbound push stream to one browser tab.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::frame::{CloseReason, Frame};
use crate::auth::Identity;

pub type ConnectionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Draining,
    Closed,
}

/// Outcome of [`PushConnection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queued after evicting the oldest non-critical frame.
    DroppedOldest,
    /// Did not fit and nothing could be evicted. The caller closes the connection.
    Overflow,
    /// The connection is no longer accepting frames.
    NotOpen,
}

struct QueuedFrame {
    frame: Frame,
    critical: bool,
}

struct Inner {
    state: ConnectionState,
    buffer: VecDeque<QueuedFrame>,
    /// Last time the writer flushed a frame, or the time the buffer went
    /// from idle to non-empty.
    last_ack: Instant,
    in_flight: bool,
    close_reason: Option<CloseReason>,
}

/// Bounded outgoing buffer plus lifecycle for one push stream.
///
/// Producers never wait on the network: [`send`](Self::send) only touches the
/// in-memory buffer. The hub's writer task drains it through
/// [`next_frame`](Self::next_frame).
pub struct PushConnection {
    id: ConnectionId,
    identity: Identity,
    created_at: DateTime<Utc>,
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
    cancel: CancellationToken,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl PushConnection {
    pub fn new(id: ConnectionId, identity: Identity, capacity: usize) -> Self {
        Self {
            id,
            identity,
            created_at: Utc::now(),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                buffer: VecDeque::new(),
                last_ack: Instant::now(),
                in_flight: false,
                close_reason: None,
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Move `Connecting -> Open` and queue the `connected` frame.
    pub fn open(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Connecting {
            return false;
        }
        inner.state = ConnectionState::Open;
        inner.last_ack = Instant::now();
        inner.buffer.push_back(QueuedFrame {
            frame: Frame::Connected {
                connection_id: self.id.clone(),
            },
            critical: true,
        });
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Enqueue a frame without blocking.
    ///
    /// A full buffer evicts its oldest non-critical frame. A critical frame
    /// never evicts and never gets evicted; if it does not fit the result is
    /// [`Delivery::Overflow`].
    pub fn send(&self, frame: Frame, critical: bool) -> Delivery {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Open {
            return Delivery::NotOpen;
        }

        let mut outcome = Delivery::Queued;
        if inner.buffer.len() >= self.capacity {
            if critical {
                return Delivery::Overflow;
            }
            match inner.buffer.iter().position(|q| !q.critical) {
                Some(oldest) => {
                    inner.buffer.remove(oldest);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    outcome = Delivery::DroppedOldest;
                }
                None => return Delivery::Overflow,
            }
        }

        if inner.buffer.is_empty() && !inner.in_flight {
            inner.last_ack = Instant::now();
        }
        inner.buffer.push_back(QueuedFrame { frame, critical });
        drop(inner);
        self.notify.notify_one();
        outcome
    }

    /// Queue a keepalive unless real frames are already pending.
    pub fn send_keepalive(&self) -> bool {
        {
            let inner = self.inner.lock();
            if inner.state != ConnectionState::Open || !inner.buffer.is_empty() {
                return false;
            }
        }
        self.send(Frame::Keepalive, false) == Delivery::Queued
    }

    /// Next frame for the writer, or `None` once the connection is done.
    ///
    /// A `Draining` connection becomes `Closed` when its buffer runs dry.
    pub async fn next_frame(&self) -> Option<Frame> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(queued) = inner.buffer.pop_front() {
                    inner.in_flight = true;
                    return Some(queued.frame);
                }
                match inner.state {
                    ConnectionState::Draining => {
                        inner.state = ConnectionState::Closed;
                        drop(inner);
                        self.cancel.cancel();
                        return None;
                    }
                    ConnectionState::Closed => return None,
                    ConnectionState::Connecting | ConnectionState::Open => {}
                }
            }

            tokio::select! {
                () = self.notify.notified() => {}
                () = self.cancel.cancelled() => {}
            }
        }
    }

    /// Record that the frame last returned by `next_frame` reached the transport.
    pub fn mark_flushed(&self, was_event: bool) {
        let mut inner = self.inner.lock();
        inner.in_flight = false;
        inner.last_ack = Instant::now();
        if was_event {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Whether frames have been waiting on the transport for longer than `grace`.
    pub fn is_stalled(&self, grace: Duration) -> bool {
        let inner = self.inner.lock();
        (inner.in_flight || !inner.buffer.is_empty()) && inner.last_ack.elapsed() >= grace
    }

    /// Begin teardown. Returns `false` if teardown had already begun.
    ///
    /// Client-visible reasons queue a final frame and let the writer drain;
    /// abrupt reasons discard the buffer and close at once. Safe to call from
    /// any task, any number of times.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            ConnectionState::Draining | ConnectionState::Closed
        ) {
            return false;
        }
        inner.close_reason = Some(reason);

        if reason.is_abrupt() || inner.state == ConnectionState::Connecting {
            inner.buffer.clear();
            inner.state = ConnectionState::Closed;
            drop(inner);
            self.cancel.cancel();
        } else {
            if reason.sends_frame() {
                inner.buffer.push_back(QueuedFrame {
                    frame: Frame::Closing { reason },
                    critical: true,
                });
            }
            inner.state = ConnectionState::Draining;
            drop(inner);
        }
        self.notify.notify_one();
        true
    }

    /// Fires once the connection reaches `Closed`.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
