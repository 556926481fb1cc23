//! Codec and configuration error types.

use thiserror::Error;

/// Errors produced while packing or unpacking a wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The payload (or the declared payload length) exceeds the configured bound.
    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual or declared payload length.
        len: usize,
        /// Configured maximum payload length.
        max: usize,
    },
    /// Fewer bytes than a full header were available.
    #[error("truncated header: {available} of {expected} bytes")]
    TruncatedHeader {
        /// Bytes present in the frame.
        available: usize,
        /// Header width.
        expected: usize,
    },
    /// The header declared more payload than the frame carries.
    #[error("truncated payload: declared {declared} bytes, {available} available")]
    TruncatedPayload {
        /// Payload length announced by the header.
        declared: usize,
        /// Payload bytes actually present.
        available: usize,
    },
    /// The frame carries bytes past the declared payload.
    #[error("frame has {extra} trailing bytes after a {declared}-byte payload")]
    TrailingBytes {
        /// Payload length announced by the header.
        declared: usize,
        /// Unexpected bytes after the payload.
        extra: usize,
    },
}

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A config value was invalid (e.g., out of range).
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
