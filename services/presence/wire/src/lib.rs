//! Packet framing for the presence IPC protocol.
//!
//! Every message exchanged with the local peer is a small binary envelope
//! wrapping a UTF-8 JSON document.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 opcode (LE)      | handshake, frame, close .. |
//! +----------------------+----------------------------+
//! | u32 length (LE)      | byte length of the payload |
//! +----------------------+----------------------------+
//! | payload              | `length` bytes of JSON     |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod packet;

// Re-export main types
pub use error::WireError;
pub use packet::{
    pack, pack_json, Opcode, Packet, PacketDecoder, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};
