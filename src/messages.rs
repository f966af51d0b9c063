//! Matter message framing: the plaintext envelope, the protocol header
//! carried inside it, status reports and builders for the protocol
//! messages the commissioning client sends.

use byteorder::{LittleEndian, ReadBytesExt};
use core::fmt;
use std::io::{Cursor, Read};

use crate::error::{Error, Result};
use crate::tlv::{self, TlvElement, TlvWriter};

/// Message envelope, always sent in the clear.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub flags: u8,
    pub session_id: u16,
    pub security_flags: u8,
    pub message_counter: u32,
    pub source_node_id: Option<[u8; 8]>,
    /// Two or eight bytes when present.
    pub destination_node_id: Option<Vec<u8>>,
}

impl MessageHeader {
    const FLAG_SOURCE_PRESENT: u8 = 1 << 2;
    const DSIZ_MASK: u8 = 0x03;
    const DSIZ_64: u8 = 1;
    const DSIZ_16: u8 = 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.source_node_id.is_some() {
            flags |= Self::FLAG_SOURCE_PRESENT;
        }
        match self.destination_node_id.as_ref().map(Vec::len) {
            Some(8) => flags |= Self::DSIZ_64,
            Some(2) => flags |= Self::DSIZ_16,
            _ => {}
        }
        let mut out = Vec::with_capacity(18);
        out.push(flags);
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.push(self.security_flags);
        out.extend_from_slice(&self.message_counter.to_le_bytes());
        if let Some(src) = &self.source_node_id {
            out.extend_from_slice(src);
        }
        match self.destination_node_id.as_deref() {
            Some(dst) if dst.len() == 8 || dst.len() == 2 => out.extend_from_slice(dst),
            _ => {}
        }
        out
    }

    /// Decode the envelope; returns the header and the number of bytes it
    /// occupied, so the caller can slice out the AEAD associated data.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(data);
        let err = |_| Error::Framing("truncated message header");
        let flags = cursor.read_u8().map_err(err)?;
        let session_id = cursor.read_u16::<LittleEndian>().map_err(err)?;
        let security_flags = cursor.read_u8().map_err(err)?;
        let message_counter = cursor.read_u32::<LittleEndian>().map_err(err)?;
        let source_node_id = if flags & Self::FLAG_SOURCE_PRESENT != 0 {
            let mut id = [0u8; 8];
            cursor.read_exact(&mut id).map_err(err)?;
            Some(id)
        } else {
            None
        };
        let destination_node_id = match flags & Self::DSIZ_MASK {
            0 => None,
            Self::DSIZ_64 => Some(8),
            Self::DSIZ_16 => Some(2),
            _ => return Err(Error::Framing("reserved destination size")),
        }
        .map(|len| {
            let mut id = vec![0u8; len];
            cursor.read_exact(&mut id).map(|_| id)
        })
        .transpose()
        .map_err(err)?;
        Ok((
            Self {
                flags,
                session_id,
                security_flags,
                message_counter,
                source_node_id,
                destination_node_id,
            },
            cursor.position() as usize,
        ))
    }
}

/// Protocol header, encrypted together with the payload on a keyed
/// channel.
#[derive(Debug, Clone)]
pub struct ProtocolHeader {
    pub exchange_flags: u8,
    pub opcode: u8,
    pub exchange_id: u16,
    pub protocol_id: u16,
    pub ack_counter: Option<u32>,
}

impl ProtocolHeader {
    pub const FLAG_INITIATOR: u8 = 1 << 0;
    pub const FLAG_ACK: u8 = 1 << 1;
    pub const FLAG_RELIABILITY: u8 = 1 << 2;

    pub const OPCODE_ACK: u8 = 0x10;
    pub const OPCODE_PBKDF_REQ: u8 = 0x20;
    pub const OPCODE_PBKDF_RESP: u8 = 0x21;
    pub const OPCODE_PAKE1: u8 = 0x22;
    pub const OPCODE_PAKE2: u8 = 0x23;
    pub const OPCODE_PAKE3: u8 = 0x24;
    pub const OPCODE_SIGMA1: u8 = 0x30;
    pub const OPCODE_SIGMA2: u8 = 0x31;
    pub const OPCODE_SIGMA3: u8 = 0x32;
    pub const OPCODE_STATUS: u8 = 0x40;

    pub const IM_OPCODE_STATUS_RESP: u8 = 0x01;
    pub const IM_OPCODE_INVOKE_REQ: u8 = 0x08;
    pub const IM_OPCODE_INVOKE_RESP: u8 = 0x09;

    pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0;
    pub const PROTOCOL_ID_INTERACTION: u16 = 1;

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = self.exchange_flags;
        if self.ack_counter.is_some() {
            flags |= Self::FLAG_ACK;
        }
        let mut out = Vec::with_capacity(10);
        out.push(flags);
        out.push(self.opcode);
        out.extend_from_slice(&self.exchange_id.to_le_bytes());
        out.extend_from_slice(&self.protocol_id.to_le_bytes());
        if let Some(ack) = self.ack_counter {
            out.extend_from_slice(&ack.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(data);
        let err = |_| Error::Framing("truncated protocol header");
        let exchange_flags = cursor.read_u8().map_err(err)?;
        let opcode = cursor.read_u8().map_err(err)?;
        let exchange_id = cursor.read_u16::<LittleEndian>().map_err(err)?;
        let protocol_id = cursor.read_u16::<LittleEndian>().map_err(err)?;
        let ack_counter = if exchange_flags & Self::FLAG_ACK != 0 {
            Some(cursor.read_u32::<LittleEndian>().map_err(err)?)
        } else {
            None
        };
        Ok((
            Self {
                exchange_flags,
                opcode,
                exchange_id,
                protocol_id,
                ack_counter,
            },
            cursor.position() as usize,
        ))
    }
}

/// Status report body, `(0, 0, 0)` is success and `(_, 0, 3)` is the
/// close-session sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub general_code: u16,
    pub protocol_id: u32,
    pub protocol_code: u16,
}

impl StatusReport {
    pub const PROTOCOL_CODE_CLOSE_SESSION: u16 = 3;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let err = |_| Error::Framing("truncated status report");
        Ok(Self {
            general_code: cursor.read_u16::<LittleEndian>().map_err(err)?,
            protocol_id: cursor.read_u32::<LittleEndian>().map_err(err)?,
            protocol_code: cursor.read_u16::<LittleEndian>().map_err(err)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.general_code.to_le_bytes());
        out.extend_from_slice(&self.protocol_id.to_le_bytes());
        out.extend_from_slice(&self.protocol_code.to_le_bytes());
        out
    }

    pub fn is_success(&self) -> bool {
        self.general_code == 0 && self.protocol_id == 0 && self.protocol_code == 0
    }
}

fn general_code_name(code: u16) -> &'static str {
    match code {
        0 => "SUCCESS",
        1 => "FAILURE",
        2 => "BAD_PRECONDITION",
        3 => "OUT_OF_RANGE",
        4 => "BAD_REQUEST",
        5 => "UNSUPPORTED",
        6 => "UNEXPECTED",
        7 => "RESOURCE_EXHAUSTED",
        8 => "BUSY",
        9 => "TIMEOUT",
        10 => "CONTINUE",
        11 => "ABORTED",
        12 => "INVALID_ARGUMENT",
        13 => "NOT_FOUND",
        14 => "ALREADY_EXISTS",
        15 => "PERMISSION_DENIED",
        16 => "DATA_LOSS",
        17 => "MESSAGE_TOO_LARGE",
        _ => "UNKNOWN",
    }
}

fn secure_channel_code_name(code: u16) -> &'static str {
    match code {
        0 => "SESSION_ESTABLISHMENT_SUCCESS",
        1 => "NO_SHARED_TRUST_ROOTS",
        2 => "INVALID_PARAMETER",
        3 => "CLOSE_SESSION",
        4 => "BUSY",
        5 => "REQUIRED_CAT_MISMATCH",
        _ => "UNKNOWN",
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "OK");
        }
        write!(
            f,
            "general={} ({}) protocol={} code={}",
            self.general_code,
            general_code_name(self.general_code),
            self.protocol_id,
            self.protocol_code
        )?;
        if self.protocol_id as u16 == ProtocolHeader::PROTOCOL_ID_SECURE_CHANNEL {
            write!(f, " ({})", secure_channel_code_name(self.protocol_code))?;
        }
        Ok(())
    }
}

/// Decoded inbound message as surfaced by the secure channel.
pub struct Message {
    pub message_header: MessageHeader,
    pub protocol_header: ProtocolHeader,
    pub payload: Vec<u8>,
    /// Eagerly decoded payload tree; absent for status reports, acks and
    /// empty payloads.
    pub tlv: Option<TlvElement>,
    pub status: Option<StatusReport>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("message_header", &self.message_header)
            .field("protocol_header", &self.protocol_header)
            .field("payload", &hex::encode(&self.payload))
            .field("tlv", &self.tlv)
            .field("status", &self.status)
            .finish()
    }
}

impl Message {
    /// Assemble a record from a parsed envelope and the plaintext
    /// protocol bytes (header plus payload).
    pub fn from_parts(message_header: MessageHeader, protocol_bytes: &[u8]) -> Result<Self> {
        let (protocol_header, consumed) = ProtocolHeader::decode(protocol_bytes)?;
        let payload = protocol_bytes[consumed..].to_vec();
        let is_secure_channel =
            protocol_header.protocol_id == ProtocolHeader::PROTOCOL_ID_SECURE_CHANNEL;
        if is_secure_channel && protocol_header.opcode == ProtocolHeader::OPCODE_STATUS {
            let status = StatusReport::parse(&payload)?;
            return Ok(Self {
                message_header,
                protocol_header,
                payload,
                tlv: None,
                status: Some(status),
            });
        }
        let tlv = if payload.is_empty() {
            None
        } else {
            Some(tlv::decode(&payload)?)
        };
        Ok(Self {
            message_header,
            protocol_header,
            payload,
            tlv,
            status: None,
        })
    }

    pub fn is_standalone_ack(&self) -> bool {
        self.protocol_header.protocol_id == ProtocolHeader::PROTOCOL_ID_SECURE_CHANNEL
            && self.protocol_header.opcode == ProtocolHeader::OPCODE_ACK
    }
}

/// Build a secure-channel protocol message: header plus TLV payload.
pub fn secure_channel_message(
    opcode: u8,
    exchange_id: u16,
    payload: &[u8],
    ack_counter: Option<u32>,
) -> Vec<u8> {
    let mut out = ProtocolHeader {
        exchange_flags: ProtocolHeader::FLAG_INITIATOR | ProtocolHeader::FLAG_RELIABILITY,
        opcode,
        exchange_id,
        protocol_id: ProtocolHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter,
    }
    .encode();
    out.extend_from_slice(payload);
    out
}

/// Standalone acknowledgement for a received counter.
pub fn standalone_ack(exchange_id: u16, acked_counter: u32) -> Vec<u8> {
    ProtocolHeader {
        exchange_flags: ProtocolHeader::FLAG_INITIATOR,
        opcode: ProtocolHeader::OPCODE_ACK,
        exchange_id,
        protocol_id: ProtocolHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter: Some(acked_counter),
    }
    .encode()
}

/// Close-session status report, sent when a channel shuts down.
pub fn close_session(exchange_id: u16) -> Vec<u8> {
    let body = StatusReport {
        general_code: 0,
        protocol_id: 0,
        protocol_code: StatusReport::PROTOCOL_CODE_CLOSE_SESSION,
    }
    .encode();
    secure_channel_message(ProtocolHeader::OPCODE_STATUS, exchange_id, &body, None)
}

/// Interaction Model invoke request for a single cluster command.
pub fn im_invoke_request(
    endpoint: u16,
    cluster: u32,
    command: u32,
    exchange_id: u16,
    fields: &[u8],
    timed: bool,
) -> Vec<u8> {
    let header = ProtocolHeader {
        exchange_flags: ProtocolHeader::FLAG_INITIATOR | ProtocolHeader::FLAG_RELIABILITY,
        opcode: ProtocolHeader::IM_OPCODE_INVOKE_REQ,
        exchange_id,
        protocol_id: ProtocolHeader::PROTOCOL_ID_INTERACTION,
        ack_counter: None,
    }
    .encode();

    let mut w = TlvWriter::new();
    w.raw(&header);
    w.begin_struct();
    w.boolean(0, false); // suppress response
    w.boolean(1, timed);
    w.begin_array(2);
    w.begin_struct();
    w.begin_list(0); // command path
    w.uint16(0, endpoint);
    w.uint32(1, cluster);
    w.uint32(2, command);
    w.end_container();
    w.begin_struct_tagged(1); // command fields
    w.raw(fields);
    w.end_container();
    w.end_container();
    w.end_container();
    w.uint8(0xff, 10); // interaction model revision
    w.end_container();
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_flag_roundtrip() {
        let cases: &[(Option<[u8; 8]>, Option<Vec<u8>>)] = &[
            (None, None),
            (Some([1, 2, 3, 4, 5, 6, 7, 8]), None),
            (None, Some(vec![0xaa, 0xbb])),
            (Some([9; 8]), Some(vec![1, 2, 3, 4, 5, 6, 7, 8])),
        ];
        for (src, dst) in cases {
            let header = MessageHeader {
                flags: 0,
                session_id: 0x1234,
                security_flags: 0,
                message_counter: 99,
                source_node_id: *src,
                destination_node_id: dst.clone(),
            };
            let wire = header.encode();
            let (decoded, consumed) = MessageHeader::decode(&wire).unwrap();
            assert_eq!(consumed, wire.len());
            assert_eq!(decoded.source_node_id, *src);
            assert_eq!(decoded.destination_node_id, *dst);
            assert_eq!(decoded.session_id, 0x1234);
            assert_eq!(decoded.message_counter, 99);
        }
    }

    #[test]
    fn protocol_header_ack_roundtrip() {
        let header = ProtocolHeader {
            exchange_flags: ProtocolHeader::FLAG_INITIATOR,
            opcode: 0x20,
            exchange_id: 0xba3e,
            protocol_id: 0,
            ack_counter: Some(0xcafe_f00d),
        };
        let wire = header.encode();
        let (decoded, consumed) = ProtocolHeader::decode(&wire).unwrap();
        assert_eq!(consumed, 10);
        assert_eq!(decoded.ack_counter, Some(0xcafe_f00d));
        assert_ne!(decoded.exchange_flags & ProtocolHeader::FLAG_ACK, 0);

        let no_ack = ProtocolHeader {
            ack_counter: None,
            ..header
        };
        let wire = no_ack.encode();
        let (decoded, consumed) = ProtocolHeader::decode(&wire).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(decoded.ack_counter, None);
    }

    #[test]
    fn decode_captured_pbkdf_request() {
        // pbkdf request captured from a real session
        let raw = "04000000a5a0b90d3320764c7d52ef86052060d5000015300120cabe444262d4e5dd568c755ed77e0829b9983c4d62b480b579811ec383eb69c625020837240300280418";
        let raw = hex::decode(raw).unwrap();
        let (header, consumed) = MessageHeader::decode(&raw).unwrap();
        assert_eq!(header.session_id, 0);
        let msg = Message::from_parts(header, &raw[consumed..]).unwrap();
        assert_eq!(
            msg.protocol_header.protocol_id,
            ProtocolHeader::PROTOCOL_ID_SECURE_CHANNEL
        );
        let tlv = msg.tlv.expect("payload tlv");
        assert_eq!(tlv.octets_at(&[1]).map(<[u8]>::len), Some(32));
    }

    #[test]
    fn status_report_parse_and_display() {
        let report = StatusReport {
            general_code: 1,
            protocol_id: 0,
            protocol_code: 2,
        };
        let parsed = StatusReport::parse(&report.encode()).unwrap();
        assert_eq!(parsed, report);
        assert!(!parsed.is_success());
        let text = parsed.to_string();
        assert!(text.contains("FAILURE"));
        assert!(text.contains("INVALID_PARAMETER"));

        assert!(StatusReport::parse(&[0, 0, 0]).is_err());
    }

    #[test]
    fn close_session_sentinel() {
        let wire = close_session(7);
        let (header, consumed) = ProtocolHeader::decode(&wire).unwrap();
        assert_eq!(header.opcode, ProtocolHeader::OPCODE_STATUS);
        let report = StatusReport::parse(&wire[consumed..]).unwrap();
        assert_eq!(report.general_code, 0);
        assert_eq!(report.protocol_id, 0);
        assert_eq!(
            report.protocol_code,
            StatusReport::PROTOCOL_CODE_CLOSE_SESSION
        );
    }

    #[test]
    fn invoke_request_paths() {
        let mut fields = TlvWriter::new();
        fields.octets(0, &[1, 2, 3]);
        let wire = im_invoke_request(0, 0x3e, 0x04, 11, fields.data(), false);
        let (header, consumed) = ProtocolHeader::decode(&wire).unwrap();
        assert_eq!(header.opcode, ProtocolHeader::IM_OPCODE_INVOKE_REQ);
        assert_eq!(header.protocol_id, ProtocolHeader::PROTOCOL_ID_INTERACTION);
        let tlv = tlv::decode(&wire[consumed..]).unwrap();
        assert_eq!(tlv.unsigned_at(&[2, 0, 0, 0]), Some(0));
        assert_eq!(tlv.unsigned_at(&[2, 0, 0, 1]), Some(0x3e));
        assert_eq!(tlv.unsigned_at(&[2, 0, 0, 2]), Some(0x04));
        assert_eq!(tlv.octets_at(&[2, 0, 1, 0]), Some(&[1u8, 2, 3][..]));
        assert_eq!(tlv.bool_at(&[1]), Some(false));
    }
}
