//! Live push hub.
//!
//! Producers publish onto the [`EventBus`](crate::events::EventBus); the
//! [`BroadcastHub`] fans each event out to every registered
//! [`PushConnection`], and each connection's writer task drains its own
//! bounded buffer into a [`PushTransport`].

mod broadcast;
mod connection;
mod frame;
pub mod sse;
mod transport;

pub use broadcast::{BroadcastHub, HubPolicy, Subscription};
pub use connection::{ConnectionId, ConnectionState, Delivery, PushConnection};
pub use frame::{CloseReason, Frame};
pub use transport::{ChannelTransport, PushTransport, TRANSPORT_CHANNEL_SIZE};
