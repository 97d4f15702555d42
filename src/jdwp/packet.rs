//! Packet framing and the handshake literal (spec.md §4.9).
//!
//! Every packet on the wire starts with an 11-byte header: a 4-byte
//! big-endian length (the header is included in the count), a 4-byte
//! big-endian request id, and a 1-byte flags field whose only defined bit
//! is `FLAG_REPLY`. What follows the flags byte depends on the direction:
//! a command (`cmd_set`, `cmd`) pair for requests, a 2-byte big-endian
//! error code for replies. All multi-byte fields are big-endian.

use crate::util::error::JdwpError;

pub const HEADER_LEN: usize = 11;
pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";
pub const FLAG_REPLY: u8 = 0x80;

pub const DDM_CMD_SET: u8 = 199;
pub const DDM_CMD: u8 = 1;

/// A fully-framed JDWP packet, owning its body bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Request { id: u32, cmd_set: u8, cmd: u8, data: Vec<u8> },
    Reply { id: u32, error: u16, data: Vec<u8> },
}

impl Packet {
    pub fn id(&self) -> u32 {
        match self {
            Packet::Request { id, .. } => *id,
            Packet::Reply { id, .. } => *id,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Packet::Request { data, .. } => data,
            Packet::Reply { data, .. } => data,
        }
    }

    pub fn reply_ok(id: u32, data: Vec<u8>) -> Packet {
        Packet::Reply { id, error: JdwpError::None.code(), data }
    }

    pub fn reply_err(id: u32, error: JdwpError) -> Packet {
        Packet::Reply { id, error: error.code(), data: Vec::new() }
    }

    /// Serializes this packet into the exact on-wire byte sequence,
    /// including the 11-byte header and the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data().len());
        let total_len = (HEADER_LEN + self.data().len()) as u32;
        out.extend_from_slice(&total_len.to_be_bytes());
        out.extend_from_slice(&self.id().to_be_bytes());
        match self {
            Packet::Request { cmd_set, cmd, data, .. } => {
                out.push(0);
                out.push(*cmd_set);
                out.push(*cmd);
                out.extend_from_slice(data);
            }
            Packet::Reply { error, data, .. } => {
                out.push(FLAG_REPLY);
                out.extend_from_slice(&error.to_be_bytes());
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Parses exactly one packet out of the front of `buf`. Returns the
    /// packet and the number of bytes it consumed. `buf` may contain
    /// trailing bytes belonging to the next packet; those are left alone.
    pub fn decode(buf: &[u8]) -> Result<(Packet, usize), JdwpError> {
        if buf.len() < HEADER_LEN {
            return Err(JdwpError::IllegalArgument);
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length < HEADER_LEN || buf.len() < length {
            return Err(JdwpError::IllegalArgument);
        }
        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let flags = buf[8];
        let body = &buf[HEADER_LEN..length];
        let packet = if flags & FLAG_REPLY != 0 {
            let error = u16::from_be_bytes([buf[9], buf[10]]);
            Packet::Reply { id, error, data: body.to_vec() }
        } else {
            Packet::Request { id, cmd_set: buf[9], cmd: buf[10], data: body.to_vec() }
        };
        Ok((packet, length))
    }
}

/// Whether `buf` begins with the full 14-byte handshake literal.
pub fn is_handshake(buf: &[u8]) -> bool {
    buf.len() >= HANDSHAKE.len() && &buf[..HANDSHAKE.len()] == HANDSHAKE.as_slice()
}
