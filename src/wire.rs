//! # SOME/IP Wire Format
//!
//! Encoding and decoding of SOME/IP headers and messages, plus the framing
//! helpers the endpoints use to split datagrams and byte streams into
//! individual messages.
//!
//! ## SOME/IP Header Format (16 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ──────────────────────────────────────────────────────
//!   0      2    Service ID
//!   2      2    Method ID (or Event ID if bit 15 set)
//!   4      4    Length (header from byte 8 + payload)
//!   8      2    Client ID
//!  10      2    Session ID
//!  12      1    Protocol Version (always 0x01)
//!  13      1    Interface Version
//!  14      1    Message Type
//!  15      1    Return Code
//! ──────────────────────────────────────────────────────
//! ```
//!
//! The length field covers everything after itself, so a valid message has
//! `total_size = 8 + length` and `length >= 8`.
//!
//! ## Message Types
//!
//! | Value | Name | Description |
//! |-------|------|-------------|
//! | 0x00 | REQUEST | RPC request expecting response |
//! | 0x01 | REQUEST_NO_RETURN | Fire-and-forget request |
//! | 0x02 | NOTIFICATION | Event/notification message |
//! | 0x80 | RESPONSE | RPC response (success or error) |
//! | 0x81 | ERROR | RPC error response (explicit error type) |
//! | 0x20 | TP_REQUEST | Segmented request (TP flag set) |
//! | 0x21 | TP_REQUEST_NO_RETURN | Segmented fire-and-forget |
//! | 0x22 | TP_NOTIFICATION | Segmented notification |
//! | 0xA0 | TP_RESPONSE | Segmented response |
//! | 0xA1 | TP_ERROR | Segmented error |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ClientId, MethodId, ServiceId, SessionId};

/// SOME/IP protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

// Header field positions.
pub const SERVICE_POS: usize = 0;
pub const METHOD_POS: usize = 2;
pub const LENGTH_POS: usize = 4;
pub const CLIENT_POS: usize = 8;
pub const SESSION_POS: usize = 10;
pub const PROTOCOL_VERSION_POS: usize = 12;
pub const INTERFACE_VERSION_POS: usize = 13;
pub const MESSAGE_TYPE_POS: usize = 14;
pub const RETURN_CODE_POS: usize = 15;

/// Bytes of header not covered by the length field (service, method, length).
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Service Discovery service id (0xFFFF)
pub const SD_SERVICE_ID: ServiceId = 0xFFFF;
/// Service Discovery method id (0x8100)
pub const SD_METHOD_ID: MethodId = 0x8100;

// ============================================================================
// FRAMING HELPERS
// ============================================================================

/// Declared total size of the first SOME/IP message in `data`:
/// `8 + big_endian_u32(data[4..8])`, or `0` if fewer than 8 bytes remain.
pub fn get_message_size(data: &[u8]) -> usize {
    if data.len() < LENGTH_PREFIX_SIZE {
        return 0;
    }
    let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    LENGTH_PREFIX_SIZE + length as usize
}

/// True for message types whose sender expects to be found again by the
/// `(client, session)` reply table: REQUEST, REQUEST_NO_RETURN and
/// NOTIFICATION.
pub fn is_request(message_type: u8) -> bool {
    matches!(message_type, 0x00 | 0x01 | 0x02)
}

/// Service id of the message starting at `data`, if a full prefix is present.
pub fn peek_service(data: &[u8]) -> Option<ServiceId> {
    if data.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([data[0], data[1]]))
}

/// Client id field of the message starting at `data`.
pub fn peek_client(data: &[u8]) -> Option<ClientId> {
    if data.len() < CLIENT_POS + 2 {
        return None;
    }
    Some(u16::from_be_bytes([data[CLIENT_POS], data[CLIENT_POS + 1]]))
}

/// Session id field of the message starting at `data`.
pub fn peek_session(data: &[u8]) -> Option<SessionId> {
    if data.len() < SESSION_POS + 2 {
        return None;
    }
    Some(u16::from_be_bytes([
        data[SESSION_POS],
        data[SESSION_POS + 1],
    ]))
}

// ============================================================================
// Magic Cookie (TCP Resynchronization)
// ============================================================================

/// Magic Cookie Method ID for client requests (0x0000)
pub const MAGIC_COOKIE_CLIENT_METHOD_ID: u16 = 0x0000;

/// Magic Cookie Method ID for server responses (0x8000)
pub const MAGIC_COOKIE_SERVER_METHOD_ID: u16 = 0x8000;

/// Check if bytes start with a Magic Cookie message.
///
/// Returns true if the first 4 bytes match the Magic Cookie pattern
/// (Service ID 0xFFFF, Method ID 0x0000 or 0x8000).
pub fn is_magic_cookie(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    if data[0] != 0xFF || data[1] != 0xFF {
        return false;
    }
    (data[2] == 0x00 && data[3] == 0x00) || (data[2] == 0x80 && data[3] == 0x00)
}

// ============================================================================
// MESSAGE TYPES
// ============================================================================

/// SOME/IP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Response = 0x80,
    Error = 0x81,
    TpRequest = 0x20,
    TpRequestNoReturn = 0x21,
    TpNotification = 0x22,
    TpResponse = 0xA0,
    TpError = 0xA1,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::RequestNoReturn),
            0x02 => Some(Self::Notification),
            0x80 => Some(Self::Response),
            0x81 => Some(Self::Error),
            0x20 => Some(Self::TpRequest),
            0x21 => Some(Self::TpRequestNoReturn),
            0x22 => Some(Self::TpNotification),
            0xA0 => Some(Self::TpResponse),
            0xA1 => Some(Self::TpError),
            _ => None,
        }
    }

    /// Check if this is a TP-flagged message type
    pub fn is_tp(&self) -> bool {
        (*self as u8) & 0x20 != 0
    }

    /// Check if this is a request type (expects response)
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Request | Self::TpRequest)
    }

    /// Check if this is a notification
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification | Self::TpNotification)
    }

    /// Check if this is a response or error
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::Response | Self::Error | Self::TpResponse | Self::TpError
        )
    }
}

// ============================================================================
// HEADER
// ============================================================================

/// SOME/IP message header (16 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub service_id: u16,
    pub method_id: u16,
    /// Length of everything after the length field (>= 8 for a valid message).
    pub length: u32,
    pub client_id: u16,
    pub session_id: u16,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: u8,
}

impl Header {
    /// Size of the full header in bytes
    pub const SIZE: usize = 16;

    /// Parse a header from the buffer. Advances the buffer past the header.
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }
        let service_id = buf.get_u16();
        let method_id = buf.get_u16();
        let length = buf.get_u32();
        let client_id = buf.get_u16();
        let session_id = buf.get_u16();
        let protocol_version = buf.get_u8();
        let interface_version = buf.get_u8();
        let message_type = MessageType::from_u8(buf.get_u8())?;
        let return_code = buf.get_u8();

        if (length as usize) < Self::SIZE - LENGTH_PREFIX_SIZE {
            return None;
        }

        Some(Self {
            service_id,
            method_id,
            length,
            client_id,
            session_id,
            protocol_version,
            interface_version,
            message_type,
            return_code,
        })
    }

    /// Serialize the header into the buffer.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.service_id);
        buf.put_u16(self.method_id);
        buf.put_u32(self.length);
        buf.put_u16(self.client_id);
        buf.put_u16(self.session_id);
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.interface_version);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.return_code);
    }

    /// Payload length implied by the length field.
    pub fn payload_length(&self) -> usize {
        self.length as usize - (Self::SIZE - LENGTH_PREFIX_SIZE)
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

/// A complete SOME/IP message: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Bytes,
}

impl Message {
    /// Build a message, fixing up the header length field from the payload.
    pub fn new(mut header: Header, payload: Bytes) -> Self {
        header.length = (Header::SIZE - LENGTH_PREFIX_SIZE + payload.len()) as u32;
        Self { header, payload }
    }

    /// Parse a message from the buffer. Advances past header and payload.
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        let header = Header::parse(buf)?;
        let payload_len = header.payload_length();
        if buf.remaining() < payload_len {
            return None;
        }
        let payload = buf.copy_to_bytes(payload_len);
        Some(Self { header, payload })
    }

    /// Serialize header and payload into a fresh buffer.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Header::SIZE + self.payload.len());
        self.header.serialize(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Total size on the wire.
    pub fn wire_size(&self) -> usize {
        Header::SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            service_id: 0x1234,
            method_id: 0x0421,
            length: 8,
            client_id: 0x0043,
            session_id: 0x0001,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 0x01,
            message_type: MessageType::Request,
            return_code: 0x00,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), Header::SIZE);

        let parsed = Header::parse(&mut buf.freeze()).expect("valid header");
        assert_eq!(parsed, header);
    }

    #[test]
    fn message_round_trip_all_fields() {
        let message = Message::new(
            Header {
                service_id: 0xABCD,
                method_id: 0x8001,
                length: 0,
                client_id: 0x1234,
                session_id: 0xFFFF,
                protocol_version: PROTOCOL_VERSION,
                interface_version: 0x03,
                message_type: MessageType::Notification,
                return_code: 0x00,
            },
            Bytes::from_static(&[0xAA, 0xBB, 0xCC]),
        );
        let wire = message.serialize();
        assert_eq!(wire.len(), 19);

        let parsed = Message::parse(&mut wire.clone()).expect("valid message");
        assert_eq!(parsed, message);
    }

    #[test]
    fn declared_size_matches_serialized_size() {
        for payload_len in [0usize, 1, 8, 100, 1392] {
            let message = Message::new(sample_header(), Bytes::from(vec![0x55; payload_len]));
            let wire = message.serialize();
            assert_eq!(get_message_size(&wire), wire.len());
        }
    }

    #[test]
    fn message_size_needs_eight_bytes() {
        assert_eq!(get_message_size(&[]), 0);
        assert_eq!(get_message_size(&[0x12, 0x34, 0x00, 0x01, 0x00, 0x00, 0x00]), 0);

        let data = [0x12, 0x34, 0x00, 0x01, 0x00, 0x00, 0x00, 0x08];
        assert_eq!(get_message_size(&data), 16);
    }

    #[test]
    fn request_classification() {
        assert!(is_request(0x00));
        assert!(is_request(0x01));
        assert!(is_request(0x02));
        assert!(!is_request(0x80));
        assert!(!is_request(0x81));
        assert!(!is_request(0x20));
    }

    #[test]
    fn header_rejects_undersized_length() {
        let mut buf = BytesMut::new();
        let mut header = sample_header();
        header.length = 7;
        header.serialize(&mut buf);
        assert!(Header::parse(&mut buf.freeze()).is_none());
    }

    #[test]
    fn magic_cookie_detection() {
        let client_cookie = [
            0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01,
            0x01, 0x00,
        ];
        assert!(is_magic_cookie(&client_cookie));

        let server_cookie = [0xFF, 0xFF, 0x80, 0x00];
        assert!(is_magic_cookie(&server_cookie));

        assert!(!is_magic_cookie(&[0x12, 0x34, 0x00, 0x00]));
        assert!(!is_magic_cookie(&[0xFF, 0xFF]));
    }

    #[test]
    fn peek_helpers() {
        let message = Message::new(sample_header(), Bytes::new());
        let wire = message.serialize();
        assert_eq!(peek_service(&wire), Some(0x1234));
        assert_eq!(peek_client(&wire), Some(0x0043));
        assert_eq!(peek_session(&wire), Some(0x0001));
        assert_eq!(peek_service(&wire[..1]), None);
    }
}
