// # Wire Framing
//
// Fixed-size packet header of eight 32-bit fields in network byte order.
// Bodies of `buffer_size` bytes follow COMMAND, DATA, and ERROR packets;
// CLOSE carries no body. The first packet on a fresh server-to-server
// connection carries the literal MAGIC payload.

use crate::common::{NodeId, RequestId};
use crate::error::{DbError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Literal first-packet payload on new server-to-server connections
pub const MAGIC: [u8; 8] = *b"CRVS\0MGC";

/// Packet type field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    Command = 0,
    Data = 1,
    Abort = 2,
    Close = 3,
    Error = 4,
    Magic = 5,
}

impl PacketType {
    pub fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => PacketType::Command,
            1 => PacketType::Data,
            2 => PacketType::Abort,
            3 => PacketType::Close,
            4 => PacketType::Error,
            5 => PacketType::Magic,
            other => return Err(DbError::Network(format!("unknown packet type {}", other))),
        })
    }

    /// Whether a body follows the header
    pub fn has_body(&self, buffer_size: u32) -> bool {
        match self {
            PacketType::Close | PacketType::Abort => false,
            _ => buffer_size > 0,
        }
    }
}

// Function codes
pub const FC_NONE: u32 = 0;
/// Rebind the connection's forwarding target to another node
pub const FC_SET_ROUTER: u32 = 1;
/// Handshake body carrying the database name
pub const FC_DATA_REQUEST: u32 = 2;
/// Execute an encoded plan
pub const FC_EXECUTE_PLAN: u32 = 3;
/// Stream a remote class scan back as DATA packets
pub const FC_REMOTE_SCAN: u32 = 4;

// Master protocol function codes
pub const FC_SERVER_REQUEST: u32 = 10;
pub const FC_SERVER_REQUEST_NEW: u32 = 11;
pub const FC_SERVER_REQUEST_ACCEPTED: u32 = 12;
pub const FC_SERVER_REQUEST_ACCEPTED_NEW: u32 = 13;
pub const FC_SERVER_ALREADY_EXISTS: u32 = 14;
/// Handshake reply: close and redo against the indicated port
pub const FC_RECONNECT_NEW_PORT: u32 = 15;

/// The fixed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub ptype: PacketType,
    pub function_code: u32,
    pub request_id: RequestId,
    pub transaction_id: u32,
    pub db_error: i32,
    pub buffer_size: u32,
    pub node_id: NodeId,
    pub reserved: u32,
}

impl PacketHeader {
    pub fn new(ptype: PacketType, request_id: RequestId) -> Self {
        Self {
            ptype,
            function_code: FC_NONE,
            request_id,
            transaction_id: 0,
            db_error: 0,
            buffer_size: 0,
            node_id: 0,
            reserved: 0,
        }
    }

    pub fn with_function(mut self, function_code: u32) -> Self {
        self.function_code = function_code;
        self
    }

    pub fn with_body_size(mut self, size: usize) -> Self {
        self.buffer_size = size as u32;
        self
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_transaction(mut self, transaction_id: u32) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u32(self.ptype as u32);
        buf.put_u32(self.function_code);
        buf.put_u32(self.request_id as u32);
        buf.put_u32(self.transaction_id);
        buf.put_i32(self.db_error);
        buf.put_u32(self.buffer_size);
        buf.put_u32(self.node_id);
        buf.put_u32(self.reserved);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DbError::Network("short packet header".to_string()));
        }
        let mut buf = &bytes[..HEADER_SIZE];
        let ptype = PacketType::from_wire(buf.get_u32())?;
        let function_code = buf.get_u32();
        let request_id_raw = buf.get_u32();
        if request_id_raw > u16::MAX as u32 {
            return Err(DbError::Network(format!(
                "request id {} exceeds 16 bits",
                request_id_raw
            )));
        }
        Ok(Self {
            ptype,
            function_code,
            request_id: request_id_raw as RequestId,
            transaction_id: buf.get_u32(),
            db_error: buf.get_i32(),
            buffer_size: buf.get_u32(),
            node_id: buf.get_u32(),
            reserved: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = PacketHeader {
            ptype: PacketType::Data,
            function_code: FC_REMOTE_SCAN,
            request_id: 0x1234,
            transaction_id: 77,
            db_error: -5,
            buffer_size: 4096,
            node_id: 3,
            reserved: 0,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_network_byte_order() {
        let header = PacketHeader::new(PacketType::Close, 1);
        let bytes = header.encode();
        // type field is the first big-endian u32
        assert_eq!(&bytes[..4], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_reject_short_header() {
        assert!(PacketHeader::decode(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_reject_unknown_type() {
        let mut bytes = PacketHeader::new(PacketType::Close, 1).encode();
        bytes[3] = 99;
        assert!(PacketHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_close_has_no_body() {
        assert!(!PacketType::Close.has_body(100));
        assert!(PacketType::Data.has_body(100));
        assert!(!PacketType::Data.has_body(0));
    }
}
