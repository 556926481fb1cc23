//! Error types for the connection engine, registry, dispatcher and server.

use thiserror::Error;
use tidewire_core::{ConfigError, PacketError};

use crate::connection::ConnId;

/// Errors raised by a transport while reading or writing frames.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// The other side has gone away.
    #[error("transport closed")]
    Closed,
}

/// Errors returned by [`Connection`](crate::Connection) send operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection has been stopped.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is at capacity (non-blocking sends only).
    #[error("outbound queue full")]
    QueueFull,
    /// The message could not be encoded.
    #[error("failed to pack message: {0}")]
    Packet(#[from] PacketError),
    /// A structured payload could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by registry lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No live connection has this id.
    #[error("connection {0} not found")]
    NotFound(ConnId),
    /// The registry already holds the maximum number of connections.
    #[error("registry is full ({0} connections)")]
    Full(usize),
}

/// Errors returned when handing a request to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The worker pool has been shut down.
    #[error("worker pool is closed")]
    PoolClosed,
}

/// Errors raised by the server while binding or accepting sessions.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The connection limit has been reached.
    #[error("connection limit of {0} reached")]
    TooManyConnections(usize),
    /// The server is shutting down and no longer accepts sessions.
    #[error("server is shutting down")]
    ShuttingDown,
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Generic I/O failure after binding.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
