//! A decoded message paired with the connection it arrived on.

use std::sync::Arc;

use bytes::Bytes;
use tidewire_core::{Message, MsgId};

use crate::connection::Connection;

/// What a handler receives.
#[derive(Clone, Debug)]
pub struct Request {
    conn: Arc<Connection>,
    message: Message,
}

impl Request {
    /// Pair a message with its connection.
    pub fn new(conn: Arc<Connection>, message: Message) -> Self {
        Self { conn, message }
    }

    /// The originating connection, for replies and lifecycle control.
    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// The decoded message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Shorthand for `message().msg_id()`.
    pub fn msg_id(&self) -> MsgId {
        self.message.msg_id()
    }

    /// Shorthand for `message().payload()`.
    pub fn data(&self) -> &Bytes {
        self.message.payload()
    }

    /// Take the connection and message apart.
    pub fn into_parts(self) -> (Arc<Connection>, Message) {
        (self.conn, self.message)
    }
}
