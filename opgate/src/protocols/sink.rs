//! The client side of a streaming response.
use std::convert::Infallible;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::StreamError;

const CHANNEL_CAPACITY: usize = 16;

/// A client connection that bytes are written to and flushed on.
#[async_trait]
pub trait ResponseSink: Send + 'static {
    /// Buffers `data` until the next flush.
    async fn write(&mut self, data: &[u8]) -> Result<(), StreamError>;

    /// Sends everything written since the last flush to the client.
    async fn flush(&mut self) -> Result<(), StreamError>;

    /// Whether flushes reach the client before the response ends.
    fn supports_flush(&self) -> bool {
        true
    }
}

/// Feeds an HTTP response body, each flush becoming one body frame.
#[derive(Debug)]
pub struct ChannelSink {
    buffer: BytesMut,
    sender: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Returns the sink and the body it streams to.
    pub fn channel() -> (Self, Body) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let body = Body::from_stream(ReceiverStream::new(receiver).map(Ok::<_, Infallible>));
        (
            Self {
                buffer: BytesMut::new(),
                sender,
            },
            body,
        )
    }

    /// Resolves once the client stopped reading the body.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let sender = self.sender.clone();
        async move { sender.closed().await }
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.sender.is_closed() {
            return Err(StreamError::ConnectionClosed);
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StreamError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let frame = self.buffer.split().freeze();
        self.sender
            .send(frame)
            .await
            .map_err(|_| StreamError::ConnectionClosed)
    }
}
