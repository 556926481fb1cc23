//! One live client session.
//!
//! A [`Connection`] owns its transport and runs two tasks once started: an
//! inbound task that decodes frames and hands them to the dispatcher, and an
//! outbound task that drains a bounded queue of encoded frames onto the
//! transport. Either task exiting, for whatever reason, stops the whole
//! connection. [`Connection::stop`] is safe to call from any task, any number
//! of times; only the first call has an effect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tidewire_core::{MsgId, PacketCodec};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dispatcher::Dispatcher;
use crate::errors::ConnectionError;
use crate::hooks::ConnectionHooks;
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DECODE_ERRORS_TOTAL, DISCONNECTIONS_TOTAL,
    FRAMES_RECEIVED_TOTAL, FRAMES_SENT_TOTAL,
};
use crate::registry::ConnectionTracker;
use crate::request::Request;
use crate::transport::{FrameReader, FrameWriter, Transport};

/// Server-assigned connection identifier.
pub type ConnId = u64;

/// Upper bound on how long the outbound task waits for the transport to close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle phase of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, tasks not yet launched.
    Created,
    /// Inbound and outbound tasks are running.
    Running,
    /// Stopped. Terminal.
    Closed,
}

/// Collaborators and limits shared by every connection a server creates.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Frame codec.
    pub codec: Arc<PacketCodec>,
    /// Where decoded requests go.
    pub dispatcher: Arc<Dispatcher>,
    /// Notified once when a connection stops.
    pub tracker: Arc<dyn ConnectionTracker>,
    /// Lifecycle callbacks.
    pub hooks: Arc<dyn ConnectionHooks>,
    /// Capacity of each connection's outbound queue.
    pub max_outbound_queue_len: usize,
    /// Inactivity after which a connection counts as dead.
    pub heartbeat_timeout: Duration,
    /// Parent token; cancelling it stops every connection built from this context.
    pub shutdown: CancellationToken,
}

struct Liveness {
    state: ConnectionState,
    last_heartbeat: Instant,
}

/// A live client session. Always handled through an `Arc`.
pub struct Connection {
    id: ConnId,
    remote_addr: SocketAddr,
    connected_at: Instant,
    liveness: RwLock<Liveness>,
    tx: mpsc::Sender<Bytes>,
    /// Transport and queue receiver, taken by whichever of start/stop runs first.
    pending: Mutex<Option<(Transport, mpsc::Receiver<Bytes>)>>,
    cancel: CancellationToken,
    codec: Arc<PacketCodec>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<dyn ConnectionTracker>,
    hooks: Arc<dyn ConnectionHooks>,
    heartbeat_timeout: Duration,
    properties: RwLock<HashMap<String, Value>>,
}

impl Connection {
    /// Create a connection in the `Created` state. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(id: ConnId, transport: Transport, ctx: &ConnectionContext) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(ctx.max_outbound_queue_len.max(1));
        let now = Instant::now();
        Arc::new(Self {
            id,
            remote_addr: transport.remote_addr(),
            connected_at: now,
            liveness: RwLock::new(Liveness {
                state: ConnectionState::Created,
                last_heartbeat: now,
            }),
            tx,
            pending: Mutex::new(Some((transport, rx))),
            cancel: ctx.shutdown.child_token(),
            codec: Arc::clone(&ctx.codec),
            dispatcher: Arc::clone(&ctx.dispatcher),
            tracker: Arc::clone(&ctx.tracker),
            hooks: Arc::clone(&ctx.hooks),
            heartbeat_timeout: ctx.heartbeat_timeout,
            properties: RwLock::new(HashMap::new()),
        })
    }

    /// Connection id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Address of the remote peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// When the connection was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ConnectionState {
        self.liveness.read().state
    }

    /// Whether [`stop`](Self::stop) has run.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Token cancelled when the connection stops. Handlers can select on it
    /// to abandon work for a dead peer.
    pub fn context(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch the inbound and outbound tasks and fire the start hook.
    ///
    /// Only the first call on a `Created` connection does anything.
    pub fn start(self: &Arc<Self>) {
        let Some((transport, rx)) = self.pending.lock().take() else {
            warn!(conn_id = self.id, "start called on a connection that is not in the created state");
            return;
        };
        {
            let mut live = self.liveness.write();
            if live.state != ConnectionState::Created {
                return;
            }
            live.state = ConnectionState::Running;
        }

        counter!(CONNECTIONS_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        debug!(conn_id = self.id, remote_addr = %self.remote_addr, "connection started");

        // The hook runs before either task can observe a failure, so a
        // stop hook never precedes the start hook.
        self.hooks.on_start(self);

        let (reader, writer) = transport.into_parts();
        let _ = tokio::spawn(Arc::clone(self).run_inbound(reader));
        let _ = tokio::spawn(Arc::clone(self).run_outbound(writer, rx));
    }

    /// Stop the connection. Idempotent and callable from any task,
    /// including the connection's own tasks and its hooks.
    pub fn stop(self: &Arc<Self>) {
        let was_running = {
            let mut live = self.liveness.write();
            match live.state {
                ConnectionState::Closed => return,
                prev => {
                    live.state = ConnectionState::Closed;
                    prev == ConnectionState::Running
                }
            }
        };

        debug!(conn_id = self.id, "stopping connection");
        self.cancel.cancel();
        // Never started: nothing else owns the transport, release it here.
        let unstarted = self.pending.lock().take();
        drop(unstarted);

        if was_running {
            self.hooks.on_stop(self);
            counter!(DISCONNECTIONS_TOTAL).increment(1);
            gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        }
        self.tracker.remove_connection(self.id);
    }

    /// Encode and enqueue a message, waiting for queue space if it is full.
    ///
    /// Fails with [`ConnectionError::Closed`] if the connection stops before
    /// or while waiting. A successful return means the frame is queued, not
    /// that it reached the peer.
    pub async fn send_msg(&self, msg_id: MsgId, data: &[u8]) -> Result<(), ConnectionError> {
        let frame = self.codec.pack(msg_id, data)?;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(ConnectionError::Closed),
            permit = self.tx.reserve() => permit.map_err(|_| ConnectionError::Closed)?,
        };

        let live = self.liveness.read();
        if live.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        permit.send(frame);
        Ok(())
    }

    /// Serialize `value` as JSON and send it as the payload of `msg_id`,
    /// waiting for queue space like [`send_msg`](Self::send_msg).
    pub async fn send_json<T>(&self, msg_id: MsgId, value: &T) -> Result<(), ConnectionError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_vec(value)?;
        self.send_msg(msg_id, &data).await
    }

    /// Encode and enqueue a message without waiting.
    pub fn try_send_msg(&self, msg_id: MsgId, data: &[u8]) -> Result<(), ConnectionError> {
        let frame = self.codec.pack(msg_id, data)?;
        self.try_send_frame(frame)
    }

    /// Enqueue an already encoded frame without waiting.
    pub(crate) fn try_send_frame(&self, frame: Bytes) -> Result<(), ConnectionError> {
        let live = self.liveness.read();
        if live.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Record activity now. The timestamp never moves backwards.
    pub fn set_ping_time(&self) {
        let now = Instant::now();
        let mut live = self.liveness.write();
        if now > live.last_heartbeat {
            live.last_heartbeat = now;
        }
    }

    /// Most recent activity.
    pub fn last_heartbeat(&self) -> Instant {
        self.liveness.read().last_heartbeat
    }

    /// `true` when more than the heartbeat timeout has passed since the last
    /// activity, i.e. the connection is dead.
    pub fn is_heartbeat_timeout(&self) -> bool {
        self.last_heartbeat_elapsed() > self.heartbeat_timeout
    }

    /// Time since the most recent activity.
    pub fn last_heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat().elapsed()
    }

    /// Attach an arbitrary value to the connection.
    pub fn set_property(&self, key: impl Into<String>, value: Value) {
        let _ = self.properties.write().insert(key.into(), value);
    }

    /// Read a value previously attached with [`set_property`](Self::set_property).
    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties.read().get(key).cloned()
    }

    /// Detach a value, returning it.
    pub fn remove_property(&self, key: &str) -> Option<Value> {
        self.properties.write().remove(key)
    }

    async fn run_inbound(self: Arc<Self>, mut reader: Box<dyn FrameReader>) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = reader.read_frame() => next,
            };
            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(conn_id = self.id, "peer closed the session");
                    break;
                }
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "read failed");
                    break;
                }
            };

            let message = match self.codec.unpack(frame) {
                Ok(message) => message,
                Err(e) => {
                    counter!(DECODE_ERRORS_TOTAL).increment(1);
                    error!(conn_id = self.id, error = %e, "malformed frame, closing connection");
                    break;
                }
            };
            counter!(FRAMES_RECEIVED_TOTAL).increment(1);
            self.set_ping_time();

            let request = Request::new(Arc::clone(&self), message);
            let dispatched = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                dispatched = self.dispatcher.dispatch(request) => dispatched,
            };
            if let Err(e) = dispatched {
                warn!(conn_id = self.id, error = %e, "dispatch failed");
                break;
            }
        }
        debug!(conn_id = self.id, "inbound task exiting");
        self.stop();
    }

    async fn run_outbound(
        self: Arc<Self>,
        mut writer: Box<dyn FrameWriter>,
        mut rx: mpsc::Receiver<Bytes>,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            // A peer that stops reading can stall the write indefinitely.
            let written = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                written = writer.write_frame(frame) => written,
            };
            if let Err(e) = written {
                debug!(conn_id = self.id, error = %e, "write failed");
                break;
            }
            counter!(FRAMES_SENT_TOTAL).increment(1);
        }

        rx.close();
        match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn_id = self.id, error = %e, "transport close failed"),
            Err(_) => debug!(conn_id = self.id, "transport close timed out"),
        }
        debug!(conn_id = self.id, "outbound task exiting");
        self.stop();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
