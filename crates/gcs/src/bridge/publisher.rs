//! The single outbound write path.
//!
//! Every response and notification goes through one mutex-guarded
//! `FramedWrite`; the lock covers exactly one frame, so frames never
//! interleave on the wire.

use std::sync::Arc;

use futures::SinkExt;
use gcs_bridge::{Frame, FrameCodec, FrameError, Message, Notification, ProtocolError, Response};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::transport::BoxWriter;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("transport closed")]
    Closed,

    #[error("failed to write frame: {0}")]
    Frame(#[from] FrameError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] ProtocolError),
}

/// Cloneable handle to the connection's writer.
///
/// Created detached so the host can hold it before a transport exists;
/// writes fail with [`PublishError::Closed`] until one is attached and after
/// the transport dies.
#[derive(Clone, Default)]
pub struct Publisher {
    writer: Arc<Mutex<Option<FramedWrite<BoxWriter, FrameCodec>>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach<W>(&self, writer: W, codec: FrameCodec)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxWriter = Box::new(writer);
        *self.writer.lock().await = Some(FramedWrite::new(boxed, codec));
    }

    pub async fn is_attached(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Flushes and shuts the writer down. Later writes fail with `Closed`.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(e) = writer.close().await
        {
            tracing::debug!(error = %e, "Error closing transport writer");
        }
    }

    /// Drops the writer without touching the transport.
    pub async fn mark_dead(&self) {
        self.writer.lock().await.take();
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), PublishError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(PublishError::Closed)?;
        if let Err(e) = writer.send(frame).await {
            tracing::error!(error = %e, "Transport write failed, marking transport dead");
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn respond(&self, id: u32, response: Response) -> Result<(), PublishError> {
        let frame = Message::Response { id, response }.to_frame()?;
        self.send_frame(frame).await
    }

    pub async fn notify(&self, notification: Notification) -> Result<(), PublishError> {
        let frame = Message::Notification(notification).to_frame()?;
        self.send_frame(frame).await
    }
}
