//! Wire codec for bridge frames
//!
//! Every frame is a fixed-size header followed by a payload:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┐
//! │ type (u32)   │ op id (u32)  │ ref id (u32) │   header, 12 bytes, big-endian
//! ├──────────────┼──────────────┴──────────────┤
//! │ len (u32)    │ encoded data (len bytes)    │   payload
//! ├──────────────┴─────────────────────────────┤
//! │ binary data (rest of frame, optional)      │
//! └────────────────────────────────────────────┘
//! ```
//!
//! One WebSocket binary message carries exactly one frame, so the binary
//! segment runs to the end of the message. Nothing here blocks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FsError, ProtocolError};

/// Size of an encoded [`Header`] in bytes
pub const HEADER_LEN: usize = 12;

/// Size of the encoded-data length prefix inside a payload
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound for a single frame (64 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Operation identifier, unique per connection while in flight
pub type OperationId = u32;

/// Reference id used for messages that answer nothing
pub const UNSOLICITED: OperationId = 0;

/// Logical message type carried in the header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    RequestWithPayload = 1,
    RequestWithBinary = 2,
    ResponseOk = 3,
    ResponseError = 4,
    Control = 5,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageType::RequestWithPayload),
            2 => Ok(MessageType::RequestWithBinary),
            3 => Ok(MessageType::ResponseOk),
            4 => Ok(MessageType::ResponseError),
            5 => Ok(MessageType::Control),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::RequestWithPayload | MessageType::RequestWithBinary
        )
    }

    pub fn is_response(self) -> bool {
        matches!(self, MessageType::ResponseOk | MessageType::ResponseError)
    }

    /// Whether frames of this type may carry a binary segment
    pub fn carries_binary(self) -> bool {
        matches!(self, MessageType::RequestWithBinary | MessageType::ResponseOk)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::RequestWithPayload => "request-with-payload",
            MessageType::RequestWithBinary => "request-with-binary",
            MessageType::ResponseOk => "response-ok",
            MessageType::ResponseError => "response-error",
            MessageType::Control => "control",
        }
    }
}

/// Fixed-size frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub operation_id: OperationId,
    pub reference_id: OperationId,
}

impl Header {
    pub const fn new(
        message_type: MessageType,
        operation_id: OperationId,
        reference_id: OperationId,
    ) -> Self {
        Self {
            message_type,
            operation_id,
            reference_id,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&(self.message_type as u32).to_be_bytes());
        out[4..8].copy_from_slice(&self.operation_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.reference_id.to_be_bytes());
        out
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.encode());
    }

    /// Decode a header from the first [`HEADER_LEN`] bytes of `bytes`
    pub fn decode(mut bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }

        let message_type = MessageType::from_u32(bytes.get_u32())?;
        let operation_id = bytes.get_u32();
        let reference_id = bytes.get_u32();

        Ok(Self {
            message_type,
            operation_id,
            reference_id,
        })
    }
}

/// Variable-length payload: an encoded (JSON) body plus optional raw bytes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
    pub binary: Option<Bytes>,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: None,
        }
    }

    pub fn with_binary(data: impl Into<Bytes>, binary: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: Some(binary.into()),
        }
    }

    /// Serialize `body` as the encoded segment
    pub fn json<T: Serialize>(body: &T, binary: Option<Bytes>) -> Result<Self, ProtocolError> {
        let data = serde_json::to_vec(body)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            data: Bytes::from(data),
            binary,
        })
    }

    /// Deserialize the encoded segment
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN + self.data.len() + self.binary.as_ref().map_or(0, |b| b.len())
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        if let Some(binary) = &self.binary {
            buf.put_slice(binary);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Split `bytes` into the encoded segment and the binary tail.
    ///
    /// Fails if the declared encoded length runs past the end of `bytes`, or
    /// if a binary tail is present on a type that never carries one.
    pub fn decode(bytes: Bytes, message_type: MessageType) -> Result<Self, ProtocolError> {
        if bytes.len() < LENGTH_PREFIX_LEN {
            return Err(ProtocolError::Truncated {
                needed: LENGTH_PREFIX_LEN,
                available: bytes.len(),
            });
        }

        let declared = (&bytes[..LENGTH_PREFIX_LEN]).get_u32() as usize;
        let needed = LENGTH_PREFIX_LEN + declared;
        if needed > bytes.len() {
            return Err(ProtocolError::Truncated {
                needed,
                available: bytes.len(),
            });
        }

        let data = bytes.slice(LENGTH_PREFIX_LEN..needed);
        let tail = bytes.slice(needed..);

        let binary = if tail.is_empty() {
            None
        } else if message_type.carries_binary() {
            Some(tail)
        } else {
            return Err(ProtocolError::UnexpectedBinary(message_type.name()));
        };

        Ok(Self { data, binary })
    }
}

/// One complete header + payload unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Payload,
}

impl Frame {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// Build a request frame; the type follows from whether `binary` is set
    pub fn request(operation_id: OperationId, payload: Payload) -> Self {
        let message_type = if payload.binary.is_some() {
            MessageType::RequestWithBinary
        } else {
            MessageType::RequestWithPayload
        };
        Self::new(Header::new(message_type, operation_id, UNSOLICITED), payload)
    }

    pub fn control(operation_id: OperationId, reference_id: OperationId, payload: Payload) -> Self {
        Self::new(
            Header::new(MessageType::Control, operation_id, reference_id),
            payload,
        )
    }

    pub fn response_ok(reference_id: OperationId, payload: Payload) -> Self {
        Self::new(
            Header::new(MessageType::ResponseOk, UNSOLICITED, reference_id),
            payload,
        )
    }

    /// Error response carrying `{code, message}`
    pub fn response_error(reference_id: OperationId, error: &FsError) -> Self {
        let payload = Payload::json(error, None).unwrap_or_else(|_| {
            Payload::new(Bytes::from_static(br#"{"code":"unknown","message":""}"#))
        });
        Self::new(
            Header::new(MessageType::ResponseError, UNSOLICITED, reference_id),
            payload,
        )
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.encoded_len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode_into(&mut buf);
        self.payload.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one frame occupying all of `bytes`
    pub fn decode(bytes: Bytes, max_frame_size: usize) -> Result<Self, ProtocolError> {
        if bytes.len() > max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: max_frame_size,
            });
        }

        let header = Header::decode(&bytes)?;
        let payload = Payload::decode(bytes.slice(HEADER_LEN..), header.message_type)?;
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let cases = [
            (MessageType::RequestWithPayload, 1, 0),
            (MessageType::RequestWithBinary, 7, 0),
            (MessageType::ResponseOk, 0, 7),
            (MessageType::ResponseError, u32::MAX, u32::MAX),
            (MessageType::Control, 42, 41),
        ];

        for (ty, op, reference) in cases {
            let header = Header::new(ty, op, reference);
            let bytes = header.encode();
            assert_eq!(bytes.len(), HEADER_LEN);
            assert_eq!(Header::decode(&bytes).unwrap(), header);
        }
    }

    #[test]
    fn test_header_rejects_short_input() {
        let bytes = Header::new(MessageType::Control, 1, 0).encode();
        let err = Header::decode(&bytes[..HEADER_LEN - 1]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: HEADER_LEN - 1
            }
        );
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let mut bytes = Header::new(MessageType::Control, 1, 0).encode();
        bytes[0..4].copy_from_slice(&99u32.to_be_bytes());
        assert_eq!(
            Header::decode(&bytes).unwrap_err(),
            ProtocolError::InvalidMessageType(99)
        );

        bytes[0..4].copy_from_slice(&0u32.to_be_bytes());
        assert!(Header::decode(&bytes).is_err());
    }

    #[test]
    fn test_payload_splits_data_and_binary() {
        let payload = Payload::with_binary(&b"{\"op\":\"x\"}"[..], &b"\x00\x01\x02"[..]);
        let encoded = payload.encode();
        assert_eq!(&encoded[..4], &10u32.to_be_bytes());

        let decoded = Payload::decode(encoded, MessageType::ResponseOk).unwrap();
        assert_eq!(&decoded.data[..], b"{\"op\":\"x\"}");
        assert_eq!(decoded.binary.as_deref(), Some(&b"\x00\x01\x02"[..]));
    }

    #[test]
    fn test_payload_without_binary() {
        let payload = Payload::new(&b"{}"[..]);
        let decoded = Payload::decode(payload.encode(), MessageType::RequestWithPayload).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_payload_rejects_binary_on_plain_request() {
        let payload = Payload::with_binary(&b"{}"[..], &b"zz"[..]);
        let err = Payload::decode(payload.encode(), MessageType::RequestWithPayload).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedBinary(_)));
    }

    #[test]
    fn test_frame_truncation_is_detected() {
        let body = br#"{"op":"stat","uri":"burrow://t/a"}"#;
        let frame = Frame::request(3, Payload::new(&body[..]));
        let encoded = frame.encode();
        let full = HEADER_LEN + LENGTH_PREFIX_LEN + body.len();
        assert_eq!(encoded.len(), full);

        for cut in 0..full {
            let result = Frame::decode(encoded.slice(..cut), DEFAULT_MAX_FRAME_SIZE);
            assert!(
                matches!(result, Err(ProtocolError::Truncated { .. })),
                "cut at {} decoded",
                cut
            );
        }

        assert_eq!(Frame::decode(encoded, DEFAULT_MAX_FRAME_SIZE).unwrap(), frame);
    }

    #[test]
    fn test_declared_length_past_end() {
        let mut buf = BytesMut::new();
        Header::new(MessageType::RequestWithPayload, 1, 0).encode_into(&mut buf);
        buf.put_u32(1000);
        buf.put_slice(b"short");

        let err = Frame::decode(buf.freeze(), DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                needed: 1004,
                available: 9
            }
        );
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::request(1, Payload::with_binary(&b"{}"[..], vec![0u8; 128]));
        let err = Frame::decode(frame.encode(), 64).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 64, .. }));
    }

    #[test]
    fn test_request_type_follows_binary() {
        assert_eq!(
            Frame::request(1, Payload::new(&b"{}"[..])).header.message_type,
            MessageType::RequestWithPayload
        );
        assert_eq!(
            Frame::request(1, Payload::with_binary(&b"{}"[..], &b"x"[..]))
                .header
                .message_type,
            MessageType::RequestWithBinary
        );
    }

    #[test]
    fn test_error_response_body() {
        let err = FsError::mount_not_found("abc");
        let frame = Frame::response_error(9, &err);
        assert_eq!(frame.header.reference_id, 9);
        let decoded: FsError = frame.payload.parse_json().unwrap();
        assert_eq!(decoded, err);
    }
}
