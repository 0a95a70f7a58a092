//! Packet encoding and decoding.
//!
//! Encoding is a pure function of the opcode and the JSON text. Decoding only
//! exists for logging inbound traffic and for test peers; the session never
//! acts on the content of what the peer sends back.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Size of the opcode + length prefix
pub const HEADER_SIZE: usize = 8;

/// Largest payload the decoder accepts (64 KiB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Known packet opcodes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Initial packet carrying protocol version and client id
    Handshake = 0,
    /// Command frame (SET_ACTIVITY and friends)
    Frame = 1,
    /// Peer-initiated close
    Close = 2,
    /// Keepalive request
    Ping = 3,
    /// Keepalive response
    Pong = 4,
}

impl Opcode {
    /// Raw wire value
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Opcode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Handshake),
            1 => Ok(Opcode::Frame),
            2 => Ok(Opcode::Close),
            3 => Ok(Opcode::Ping),
            4 => Ok(Opcode::Pong),
            other => Err(other),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Handshake => "HANDSHAKE",
            Opcode::Frame => "FRAME",
            Opcode::Close => "CLOSE",
            Opcode::Ping => "PING",
            Opcode::Pong => "PONG",
        };
        f.write_str(name)
    }
}

/// A single decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw opcode; unknown values are kept as-is
    pub opcode: u32,
    /// JSON payload bytes
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet from an opcode and JSON text
    pub fn new(opcode: u32, json: &str) -> Self {
        Self {
            opcode,
            payload: Bytes::copy_from_slice(json.as_bytes()),
        }
    }

    /// Length field value for this packet
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Known opcode, if any
    pub fn op(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode).ok()
    }

    /// Total encoded size including the header
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode to a contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u32_le(self.opcode);
        buf.put_u32_le(self.length());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Payload as UTF-8 text
    pub fn json_str(&self) -> Result<&str, WireError> {
        Ok(std::str::from_utf8(&self.payload)?)
    }

    /// Deserialize the payload
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Frame `json` under `opcode`: `LE32(opcode) || LE32(len) || json`
pub fn pack(opcode: u32, json: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + json.len());
    buf.put_u32_le(opcode);
    buf.put_u32_le(json.len() as u32);
    buf.put_slice(json.as_bytes());
    buf.freeze()
}

/// Serialize `value` to JSON and frame it under `opcode`
pub fn pack_json<T: Serialize + ?Sized>(opcode: Opcode, value: &T) -> Result<Bytes, WireError> {
    let json = serde_json::to_string(value)?;
    Ok(pack(opcode.as_u32(), &json))
}

/// Incremental decoder for inbound packets
#[derive(Debug)]
pub struct PacketDecoder {
    max_payload_size: usize,
}

impl PacketDecoder {
    /// Create a decoder with the default payload limit
    pub fn new() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Create a decoder with a custom payload limit
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a whole packet is buffered. Consumed bytes are
    /// removed from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let opcode = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

        if length > self.max_payload_size {
            return Err(WireError::Size(length));
        }

        if buf.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Packet { opcode, payload }))
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}
