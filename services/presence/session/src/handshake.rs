//! Handshake packet sent right after the transport opens.

use bytes::Bytes;
use presence_wire::{pack_json, Opcode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionError;

/// Protocol version announced in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Handshake payload: `{"v":1,"client_id":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol version
    pub v: u32,
    /// Application client identifier
    pub client_id: String,
}

impl Handshake {
    /// Create a handshake for `client_id`
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            client_id: client_id.into(),
        }
    }
}

/// Build the opcode 0 handshake packet
pub fn build_handshake(client_id: Option<&str>) -> Result<Bytes, SessionError> {
    let client_id = client_id
        .filter(|id| !id.is_empty())
        .ok_or(SessionError::MissingClientId)?;

    let bytes = pack_json(Opcode::Handshake, &Handshake::new(client_id))?;
    debug!("Built handshake for client id {}", client_id);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use presence_wire::PacketDecoder;

    #[test]
    fn test_handshake_packet() {
        let bytes = build_handshake(Some("1234567890")).unwrap();
        let mut buf = BytesMut::from(bytes.as_ref());
        let packet = PacketDecoder::new().decode(&mut buf).unwrap().unwrap();

        assert_eq!(packet.op(), Some(Opcode::Handshake));
        assert_eq!(
            packet.json_str().unwrap(),
            r#"{"v":1,"client_id":"1234567890"}"#
        );
    }

    #[test]
    fn test_handshake_requires_client_id() {
        assert!(matches!(build_handshake(None), Err(SessionError::MissingClientId)));
        assert!(matches!(build_handshake(Some("")), Err(SessionError::MissingClientId)));
    }
}
