//! Frame-level transport abstraction.
//!
//! A [`Transport`] is one accepted client session split into a reader half,
//! owned by the connection's inbound task, and a writer half, owned by its
//! outbound task. Each half deals in whole wire frames; splitting a byte
//! stream or unwrapping WebSocket messages happens inside the adapter.

pub mod stream;
pub mod websocket;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::TransportError;

pub use stream::stream_transport;
pub use websocket::websocket_transport;

/// Inbound half of a transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Wait for the next raw frame.
    ///
    /// `Ok(None)` means the peer closed the session cleanly.
    async fn read_frame(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one already-encoded frame.
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the session from the server side.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An accepted session, ready to be handed to a connection.
pub struct Transport {
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
    remote_addr: SocketAddr,
}

impl Transport {
    /// Assemble a transport from its halves.
    pub fn new(
        reader: impl FrameReader + 'static,
        writer: impl FrameWriter + 'static,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote_addr,
        }
    }

    /// Address of the remote peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Split into the reader and writer halves.
    pub fn into_parts(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}
