//! Write side of a push channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::frame::Frame;
use crate::errors::{LiveError, LiveResult};

/// Bound on frames handed to the HTTP layer but not yet written to the socket.
pub const TRANSPORT_CHANNEL_SIZE: usize = 16;

/// The socket-facing half of a push connection.
///
/// Only the connection's writer task touches the transport, and it calls
/// [`PushTransport::shutdown`] exactly once on its way out.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Write one frame. Fails with [`LiveError::TransportClosed`] once the
    /// client is gone.
    async fn write_frame(&mut self, frame: Frame) -> LiveResult<()>;

    /// Resolves when the client side has gone away.
    async fn closed(&self);

    /// Release the write side.
    async fn shutdown(&mut self);
}

/// Transport backed by an mpsc channel whose receiver feeds a response body.
pub struct ChannelTransport {
    tx: Option<mpsc::Sender<Frame>>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a transport and the receiver the response stream reads from.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl PushTransport for ChannelTransport {
    async fn write_frame(&mut self, frame: Frame) -> LiveResult<()> {
        let tx = self.tx.as_ref().ok_or(LiveError::TransportClosed)?;
        tx.send(frame).await.map_err(|_| LiveError::TransportClosed)
    }

    async fn closed(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }

    async fn shutdown(&mut self) {
        // Dropping the sender ends the receiving stream.
        self.tx.take();
    }
}
