//! Wire framing for a single message.
//!
//! Every frame on the wire has the layout
//!
//! ```text
//! +--------------------+--------------------+----------------------+
//! | payload_len: u32LE | msg_id: u32LE      | payload (payload_len)|
//! +--------------------+--------------------+----------------------+
//! ```
//!
//! Both numeric fields are little-endian. `payload_len` counts the payload
//! only, never the 8-byte header. A zero-length payload is valid.
//!
//! The declared length is checked against the configured maximum before
//! anything else is done with it, so a corrupt or hostile length field can
//! never drive an allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use crate::errors::PacketError;
use crate::message::{Message, MsgId};

/// Width of the `payload_len` field.
const LEN_FIELD_LEN: usize = 4;

/// Width of the frame header (`payload_len` + `msg_id`).
pub const HEADER_LEN: usize = 8;

/// Default bound on a single payload (64 KiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Packs and unpacks wire frames, enforcing a maximum payload length.
#[derive(Clone, Debug)]
pub struct PacketCodec {
    max_payload_len: usize,
}

impl PacketCodec {
    /// Create a codec. The bound is clamped to what the `u32` length field
    /// can express.
    pub fn new(max_payload_len: usize) -> Self {
        Self {
            max_payload_len: max_payload_len.min(u32::MAX as usize),
        }
    }

    /// Maximum payload length accepted by [`pack`](Self::pack) and
    /// [`unpack`](Self::unpack).
    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    /// Largest complete frame this codec will produce or accept.
    pub fn max_frame_len(&self) -> usize {
        HEADER_LEN + self.max_payload_len
    }

    /// Encode a message into a self-delimiting frame.
    pub fn pack(&self, msg_id: MsgId, payload: &[u8]) -> Result<Bytes, PacketError> {
        if payload.len() > self.max_payload_len {
            return Err(PacketError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload_len,
            });
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_u32_le(msg_id);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Read and validate the header at the start of `frame`.
    ///
    /// Returns the declared payload length and the message identifier.
    pub fn decode_header(&self, frame: &[u8]) -> Result<(usize, MsgId), PacketError> {
        let Some(mut header) = frame.get(..HEADER_LEN) else {
            return Err(PacketError::TruncatedHeader {
                available: frame.len(),
                expected: HEADER_LEN,
            });
        };
        let len = header.get_u32_le() as usize;
        let msg_id = header.get_u32_le();
        if len > self.max_payload_len {
            return Err(PacketError::PayloadTooLarge {
                len,
                max: self.max_payload_len,
            });
        }
        Ok((len, msg_id))
    }

    /// Decode one complete frame.
    ///
    /// The payload is a zero-copy slice of `frame`. The frame must contain
    /// exactly one message: short frames fail with
    /// [`PacketError::TruncatedPayload`], long ones with
    /// [`PacketError::TrailingBytes`].
    pub fn unpack(&self, frame: Bytes) -> Result<Message, PacketError> {
        let (declared, msg_id) = self.decode_header(&frame)?;
        let available = frame.len() - HEADER_LEN;
        if available < declared {
            return Err(PacketError::TruncatedPayload {
                declared,
                available,
            });
        }
        if available > declared {
            return Err(PacketError::TrailingBytes {
                declared,
                extra: available - declared,
            });
        }
        Ok(Message::new(msg_id, frame.slice(HEADER_LEN..)))
    }

    /// A stream splitter for byte-oriented transports.
    ///
    /// Yields whole frames (header included) ready for [`unpack`](Self::unpack).
    /// Frames announcing more than the maximum payload are rejected from the
    /// header alone, and EOF in the middle of a frame is reported as an error.
    pub fn stream_framer(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .little_endian()
            .length_field_offset(0)
            .length_field_length(LEN_FIELD_LEN)
            .length_adjustment(HEADER_LEN as isize)
            .num_skip(0)
            // Checked against the raw length field, i.e. the payload length.
            .max_frame_length(self.max_payload_len)
            .new_codec()
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use tokio_util::codec::Decoder;

    fn raw_frame(declared: u32, msg_id: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(declared);
        buf.put_u32_le(msg_id);
        buf.put_slice(payload);
        buf.freeze()
    }

    #[test]
    fn pack_layout_is_little_endian() {
        let codec = PacketCodec::default();
        let frame = codec.pack(0x0102_0304, b"ab").unwrap();
        assert_eq!(
            frame.as_ref(),
            &[2, 0, 0, 0, 0x04, 0x03, 0x02, 0x01, b'a', b'b']
        );
    }

    #[test]
    fn pack_rejects_oversized_payload() {
        let codec = PacketCodec::new(4);
        let err = codec.pack(1, b"12345").unwrap_err();
        assert_eq!(err, PacketError::PayloadTooLarge { len: 5, max: 4 });
    }

    #[test]
    fn pack_accepts_payload_at_limit() {
        let codec = PacketCodec::new(4);
        let frame = codec.pack(1, b"1234").unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 4);
    }

    #[test]
    fn empty_payload_is_valid() {
        let codec = PacketCodec::default();
        let frame = codec.pack(9, b"").unwrap();
        let msg = codec.unpack(frame).unwrap();
        assert_eq!(msg.msg_id(), 9);
        assert!(msg.is_empty());
    }

    #[test]
    fn unpack_truncated_header() {
        let codec = PacketCodec::default();
        let err = codec.unpack(Bytes::from_static(&[1, 0, 0])).unwrap_err();
        assert_eq!(
            err,
            PacketError::TruncatedHeader {
                available: 3,
                expected: HEADER_LEN
            }
        );
    }

    #[test]
    fn unpack_declared_ten_with_three_bytes_is_truncated() {
        let codec = PacketCodec::default();
        let frame = raw_frame(10, 1, b"abc");
        let err = codec.unpack(frame).unwrap_err();
        assert_eq!(
            err,
            PacketError::TruncatedPayload {
                declared: 10,
                available: 3
            }
        );
    }

    #[test]
    fn unpack_rejects_declared_length_over_max_before_reading_payload() {
        let codec = PacketCodec::new(16);
        // Header alone announces 4 GiB; nothing follows.
        let frame = raw_frame(u32::MAX, 1, b"");
        assert_matches!(
            codec.unpack(frame),
            Err(PacketError::PayloadTooLarge { len, max: 16 }) if len == u32::MAX as usize
        );
    }

    #[test]
    fn unpack_rejects_trailing_bytes() {
        let codec = PacketCodec::default();
        let frame = raw_frame(1, 1, b"xy");
        assert_eq!(
            codec.unpack(frame).unwrap_err(),
            PacketError::TrailingBytes {
                declared: 1,
                extra: 1
            }
        );
    }

    #[test]
    fn max_is_clamped_to_u32() {
        let codec = PacketCodec::new(usize::MAX);
        assert_eq!(codec.max_payload_len(), u32::MAX as usize);
    }

    #[test]
    fn stream_framer_splits_concatenated_frames() {
        let codec = PacketCodec::default();
        let mut framer = codec.stream_framer();
        let mut src = BytesMut::new();
        src.extend_from_slice(&codec.pack(1, b"first").unwrap());
        src.extend_from_slice(&codec.pack(2, b"").unwrap());
        src.extend_from_slice(&codec.pack(3, b"third").unwrap()[..6]);

        let one = framer.decode(&mut src).unwrap().unwrap();
        assert_eq!(codec.unpack(one.freeze()).unwrap().payload().as_ref(), b"first");
        let two = framer.decode(&mut src).unwrap().unwrap();
        assert_eq!(codec.unpack(two.freeze()).unwrap().msg_id(), 2);
        // Third frame is incomplete.
        assert!(framer.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn stream_framer_rejects_oversized_header_without_allocating() {
        let codec = PacketCodec::new(16);
        let mut framer = codec.stream_framer();
        let mut src = BytesMut::from(raw_frame(u32::MAX, 1, b"").as_ref());
        assert!(framer.decode(&mut src).is_err());
        assert!(src.capacity() < 1024 * 1024);
    }

    #[test]
    fn stream_framer_limit_is_on_payload_length() {
        let codec = PacketCodec::new(4);
        let mut framer = codec.stream_framer();
        let mut at_limit = BytesMut::from(raw_frame(4, 1, b"1234").as_ref());
        let frame = framer.decode(&mut at_limit).unwrap().unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 4);

        let mut over = BytesMut::from(raw_frame(5, 1, b"12345").as_ref());
        assert!(codec.stream_framer().decode(&mut over).is_err());
    }

    #[test]
    fn stream_framer_eof_mid_frame_is_an_error() {
        let codec = PacketCodec::default();
        let mut framer = codec.stream_framer();
        let mut src = BytesMut::from(raw_frame(10, 1, b"abc").as_ref());
        assert!(framer.decode_eof(&mut src).is_err());
    }

    proptest! {
        #[test]
        fn unpack_inverts_pack(msg_id in any::<u32>(), payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let codec = PacketCodec::new(512);
            let frame = codec.pack(msg_id, &payload).unwrap();
            let msg = codec.unpack(frame).unwrap();
            prop_assert_eq!(msg.msg_id(), msg_id);
            prop_assert_eq!(msg.payload().as_ref(), payload.as_slice());
        }
    }
}
