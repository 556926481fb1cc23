//! Decoded message type.

use bytes::Bytes;

/// Numeric identifier selecting which handler processes a message.
pub type MsgId = u32;

/// One decoded unit of traffic: a message identifier and its opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    msg_id: MsgId,
    payload: Bytes,
}

impl Message {
    /// Create a message from an identifier and payload.
    pub fn new(msg_id: MsgId, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_id,
            payload: payload.into(),
        }
    }

    /// The message identifier.
    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }

    /// The raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Consume the message, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
