//! In-memory transport and fixtures for exercising connections without
//! sockets. Used by this crate's unit tests and by its integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tidewire_core::{Message, MsgId, PacketCodec};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnId, Connection, ConnectionContext};
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::errors::TransportError;
use crate::hooks::ConnectionHooks;
use crate::registry::ConnectionTracker;
use crate::router::Router;
use crate::transport::{FrameReader, FrameWriter, Transport};

/// Address reported by [`channel_transport`].
pub const TEST_REMOTE_ADDR: &str = "127.0.0.1:40000";

/// The client end of an in-memory transport.
pub struct TestPeer {
    to_server: Option<mpsc::UnboundedSender<Result<Bytes, TransportError>>>,
    from_server: mpsc::UnboundedReceiver<Bytes>,
    writer_closed: Arc<AtomicBool>,
    codec: PacketCodec,
}

impl TestPeer {
    /// Deliver a raw frame to the server. Returns `false` once the server's
    /// reader is gone.
    pub fn send_raw(&self, frame: Bytes) -> bool {
        self.to_server
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }

    /// Encode and deliver a message.
    pub fn send_msg(&self, msg_id: MsgId, payload: &[u8]) -> bool {
        match self.codec.pack(msg_id, payload) {
            Ok(frame) => self.send_raw(frame),
            Err(_) => false,
        }
    }

    /// Make the server's next read fail with `err`.
    pub fn send_error(&self, err: TransportError) {
        if let Some(tx) = &self.to_server {
            let _ = tx.send(Err(err));
        }
    }

    /// Hang up: the server's reader sees a clean close.
    pub fn disconnect(&mut self) {
        self.to_server = None;
    }

    /// Next raw frame written by the server, `None` once its writer is closed
    /// and drained.
    pub async fn recv_raw(&mut self) -> Option<Bytes> {
        self.from_server.recv().await
    }

    /// Next decodable message written by the server.
    pub async fn recv_msg(&mut self) -> Option<Message> {
        let frame = self.recv_raw().await?;
        self.codec.unpack(frame).ok()
    }

    /// A frame already written by the server, without waiting.
    pub fn try_recv_raw(&mut self) -> Option<Bytes> {
        self.from_server.try_recv().ok()
    }

    /// Whether the server closed or dropped its writer.
    pub fn writer_closed(&self) -> bool {
        self.writer_closed.load(Ordering::SeqCst)
    }
}

/// Build an in-memory [`Transport`] and the peer that drives it.
pub fn channel_transport() -> (Transport, TestPeer) {
    let (to_server, inbound) = mpsc::unbounded_channel();
    let (outbound, from_server) = mpsc::unbounded_channel();
    let writer_closed = Arc::new(AtomicBool::new(false));
    let remote_addr: SocketAddr = TEST_REMOTE_ADDR
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)));

    let transport = Transport::new(
        ChannelReader { inbound },
        ChannelWriter {
            outbound: Some(outbound),
            closed: Arc::clone(&writer_closed),
        },
        remote_addr,
    );
    let peer = TestPeer {
        to_server: Some(to_server),
        from_server,
        writer_closed,
        codec: PacketCodec::default(),
    };
    (transport, peer)
}

struct ChannelReader {
    inbound: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

struct ChannelWriter {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hooks that count their invocations.
#[derive(Debug, Default)]
pub struct CountingHooks {
    /// `on_start` calls.
    pub started: AtomicUsize,
    /// `on_stop` calls.
    pub stopped: AtomicUsize,
}

impl ConnectionHooks for CountingHooks {
    fn on_start(&self, _conn: &Arc<Connection>) {
        let _ = self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stop(&self, _conn: &Arc<Connection>) {
        let _ = self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tracker that counts removals and records their ids.
#[derive(Debug, Default)]
pub struct CountingTracker {
    /// Number of removals.
    pub removed: AtomicUsize,
    /// Removed ids, in order.
    pub ids: parking_lot::Mutex<Vec<ConnId>>,
}

impl ConnectionTracker for CountingTracker {
    fn remove_connection(&self, id: ConnId) {
        let _ = self.removed.fetch_add(1, Ordering::SeqCst);
        self.ids.lock().push(id);
    }
}

/// A connection context with a direct-mode dispatcher over `router`, a
/// 16-frame outbound queue and a 30 second heartbeat timeout.
pub fn test_context(
    router: Router,
    tracker: Arc<dyn ConnectionTracker>,
    hooks: Arc<dyn ConnectionHooks>,
) -> ConnectionContext {
    let dispatcher = Dispatcher::new(
        router,
        DispatchOptions {
            worker_pool_size: 0,
            ..DispatchOptions::default()
        },
    );
    ConnectionContext {
        codec: Arc::new(PacketCodec::default()),
        dispatcher,
        tracker,
        hooks,
        max_outbound_queue_len: 16,
        heartbeat_timeout: Duration::from_secs(30),
        shutdown: CancellationToken::new(),
    }
}

/// A standalone connection with id `id`, counting hooks and tracker, and
/// an empty router. Not started.
pub fn test_connection(id: ConnId) -> (Arc<Connection>, TestPeer) {
    let ctx = test_context(
        Router::new(),
        Arc::new(CountingTracker::default()),
        Arc::new(CountingHooks::default()),
    );
    let (transport, peer) = channel_transport();
    (Connection::new(id, transport, &ctx), peer)
}
