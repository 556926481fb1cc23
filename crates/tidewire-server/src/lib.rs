//! # tidewire-server
//!
//! Per-connection concurrency engine, message dispatch and the WebSocket /
//! TCP server that feeds them.
//!
//! - [`connection`]: one live session with inbound/outbound tasks, bounded
//!   outbound queue, heartbeat tracking and once-only shutdown
//! - [`registry`]: thread-safe directory of live connections
//! - [`router`] / [`dispatcher`]: msg id → handler mapping, direct or
//!   worker-pool execution with per-connection ordering
//! - [`transport`]: frame-level transport abstraction with WebSocket and raw
//!   TCP adapters
//! - [`server`]: accepts sessions, wires hooks, serves HTTP routes
//! - [`heartbeat`]: liveness sweeps over the registry
//! - [`shutdown`], [`health`], [`metrics`]: process plumbing

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod heartbeat;
pub mod hooks;
pub mod metrics;
pub mod registry;
pub mod request;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod test_utils;
pub mod transport;

pub use connection::{ConnId, Connection, ConnectionContext, ConnectionState};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use errors::{ConnectionError, DispatchError, RegistryError, ServerError, TransportError};
pub use hooks::{ConnectionHooks, NoopHooks, ServerHooks};
pub use registry::{ConnectionRegistry, ConnectionTracker};
pub use request::Request;
pub use router::{HandlerFn, MsgHandler, Router, handler_fn};
pub use server::Server;
