//! # tidewire-core
//!
//! Protocol building blocks shared by the tidewire server and its clients.
//!
//! - [`packet`]: length-prefixed wire framing for a single message
//! - [`message`]: the decoded message type
//! - [`config`] / [`loader`]: server configuration, JSON file + env overrides
//! - [`errors`]: codec and configuration error types
//! - [`logging`]: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod loader;
pub mod logging;
pub mod message;
pub mod packet;

pub use config::{FrameMode, ServerConfig};
pub use errors::{ConfigError, PacketError};
pub use message::{Message, MsgId};
pub use packet::{HEADER_LEN, PacketCodec};
