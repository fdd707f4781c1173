//! Frames queued on a push connection.

use std::fmt;
use std::sync::Arc;

/// Why a push connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The identity carried by the connection expired mid-stream.
    Expired,
    /// A critical event did not fit in the outgoing buffer.
    Overflow,
    /// The hub is shutting down.
    Shutdown,
    /// Frames sat unflushed past the grace period.
    Stalled,
    /// The client went away.
    TransportClosed,
    /// Explicit unregister by the owner.
    Unregistered,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Expired => "session-expired",
            CloseReason::Overflow => "overflow",
            CloseReason::Shutdown => "server-shutdown",
            CloseReason::Stalled => "stalled",
            CloseReason::TransportClosed => "transport-closed",
            CloseReason::Unregistered => "unregistered",
        }
    }

    /// Reasons the client is told about with a final frame.
    pub fn sends_frame(self) -> bool {
        matches!(
            self,
            CloseReason::Expired | CloseReason::Overflow | CloseReason::Shutdown
        )
    }

    /// Reasons that abandon whatever is still buffered.
    pub fn is_abrupt(self) -> bool {
        matches!(self, CloseReason::Stalled | CloseReason::TransportClosed)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit written to a push transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// First frame on every connection.
    Connected { connection_id: String },
    /// A published event, serialized once and shared across connections.
    Event {
        seq: u64,
        event_type: String,
        data: Arc<str>,
    },
    /// Comment frame keeping intermediaries from timing the stream out.
    Keepalive,
    /// Final frame before the server closes the stream.
    Closing { reason: CloseReason },
}

impl Frame {
    pub fn is_event(&self) -> bool {
        matches!(self, Frame::Event { .. })
    }

    pub fn seq(&self) -> Option<u64> {
        match self {
            Frame::Event { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}
