//! The OpenVPN packet header codec.
//!
//! One tagged union covers both channels. Control and ACK packets carry the
//! full header (session ids, ACK list, packet id); data packets are a single
//! opcode byte followed by the encrypted envelope.
//!
//! ## Wire Format
//!
//! Control/ACK packet:
//! ```text
//! [opcode:5|key_id:3] [local_session_id:8] [ack_count:1] [ack:4]*
//! [remote_session_id:8 if ack_count>0] [packet_id:4 unless ACK] [payload]
//! ```
//!
//! Data packet:
//! ```text
//! [opcode:5|key_id:3] [payload]
//! ```

use bytes::{Buf, BufMut, BytesMut};

use super::constants::*;
use crate::error::{Error, Result};
use crate::session::SessionId;

/// Packet opcodes understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Initial key from client, forget previous state.
    ControlHardResetClientV2,
    /// Initial key from server, forget previous state.
    ControlHardResetServerV2,
    /// Control channel payload (TLS records).
    ControlV1,
    /// Acknowledgement-only packet.
    AckV1,
    /// Data channel payload.
    DataV1,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            OPCODE_CONTROL_HARD_RESET_CLIENT_V2 => Some(Self::ControlHardResetClientV2),
            OPCODE_CONTROL_HARD_RESET_SERVER_V2 => Some(Self::ControlHardResetServerV2),
            OPCODE_CONTROL_V1 => Some(Self::ControlV1),
            OPCODE_ACK_V1 => Some(Self::AckV1),
            OPCODE_DATA_V1 => Some(Self::DataV1),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::ControlHardResetClientV2 => OPCODE_CONTROL_HARD_RESET_CLIENT_V2,
            Self::ControlHardResetServerV2 => OPCODE_CONTROL_HARD_RESET_SERVER_V2,
            Self::ControlV1 => OPCODE_CONTROL_V1,
            Self::AckV1 => OPCODE_ACK_V1,
            Self::DataV1 => OPCODE_DATA_V1,
        }
    }

    /// Control packets carry a packet id; ACK and data packets do not.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::ControlHardResetClientV2 | Self::ControlHardResetServerV2 | Self::ControlV1
        )
    }

    pub fn is_ack(self) -> bool {
        self == Self::AckV1
    }

    pub fn is_data(self) -> bool {
        self == Self::DataV1
    }
}

/// A parsed OpenVPN packet.
///
/// `local_session_id` is the sender's session id, so on received packets it
/// holds the peer's id. `packet_id` is meaningful only when
/// `opcode.is_control()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: Opcode,
    pub key_id: u8,
    pub local_session_id: SessionId,
    pub acks: Vec<u32>,
    pub remote_session_id: Option<SessionId>,
    pub packet_id: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a control packet (hard reset or CONTROL_V1).
    pub fn control(
        opcode: Opcode,
        key_id: u8,
        local_session_id: SessionId,
        acks: Vec<u32>,
        remote_session_id: Option<SessionId>,
        packet_id: u32,
        payload: Vec<u8>,
    ) -> Self {
        debug_assert!(opcode.is_control());
        debug_assert!(acks.is_empty() || remote_session_id.is_some());
        Self {
            opcode,
            key_id,
            local_session_id,
            acks,
            remote_session_id,
            packet_id,
            payload,
        }
    }

    /// Build an ACK-only packet.
    pub fn ack(
        key_id: u8,
        local_session_id: SessionId,
        acks: Vec<u32>,
        remote_session_id: SessionId,
    ) -> Self {
        Self {
            opcode: Opcode::AckV1,
            key_id,
            local_session_id,
            acks,
            remote_session_id: Some(remote_session_id),
            packet_id: 0,
            payload: Vec::new(),
        }
    }

    /// Build a data packet. The payload is the encrypted envelope.
    pub fn data(key_id: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode: Opcode::DataV1,
            key_id,
            local_session_id: SessionId::default(),
            acks: Vec::new(),
            remote_session_id: None,
            packet_id: 0,
            payload,
        }
    }

    /// Serialize to wire bytes, without any stream framing.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(32 + 4 * self.acks.len() + self.payload.len());
        buf.put_u8(self.opcode.as_u8() << 3 | (self.key_id & 0x07));

        if self.opcode.is_data() {
            buf.put_slice(&self.payload);
            return buf.to_vec();
        }

        buf.put_slice(self.local_session_id.as_bytes());
        buf.put_u8(self.acks.len() as u8);
        for ack in &self.acks {
            buf.put_u32(*ack);
        }
        if !self.acks.is_empty() {
            let remote = self.remote_session_id.unwrap_or_default();
            buf.put_slice(remote.as_bytes());
        }
        if self.opcode.is_control() {
            buf.put_u32(self.packet_id);
        }
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parse a packet from wire bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < 1 {
            return Err(Error::malformed("empty packet"));
        }
        let first = buf.get_u8();
        let opcode = Opcode::from_u8(first >> 3)
            .ok_or_else(|| Error::malformed(format!("unknown opcode {}", first >> 3)))?;
        let key_id = first & 0x07;

        if opcode.is_data() {
            return Ok(Self::data(key_id, buf.to_vec()));
        }

        if buf.remaining() < SESSION_ID_LEN + 1 {
            return Err(Error::malformed("truncated control header"));
        }
        let mut sid = [0u8; SESSION_ID_LEN];
        buf.copy_to_slice(&mut sid);
        let local_session_id = SessionId::from_bytes(sid);

        let ack_count = buf.get_u8() as usize;
        if buf.remaining() < 4 * ack_count {
            return Err(Error::malformed("truncated ack list"));
        }
        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            acks.push(buf.get_u32());
        }

        let remote_session_id = if ack_count > 0 {
            if buf.remaining() < SESSION_ID_LEN {
                return Err(Error::malformed("truncated remote session id"));
            }
            let mut rsid = [0u8; SESSION_ID_LEN];
            buf.copy_to_slice(&mut rsid);
            Some(SessionId::from_bytes(rsid))
        } else {
            None
        };

        let packet_id = if opcode.is_control() {
            if buf.remaining() < 4 {
                return Err(Error::malformed("truncated packet id"));
            }
            buf.get_u32()
        } else {
            0
        };

        Ok(Self {
            opcode,
            key_id,
            local_session_id,
            acks,
            remote_session_id,
            packet_id,
            payload: buf.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(b: u8) -> SessionId {
        SessionId::from_bytes([b; 8])
    }

    #[test]
    fn test_control_roundtrip() {
        let pkt = Packet::control(
            Opcode::ControlV1,
            0,
            sid(0x11),
            vec![0, 1, 7],
            Some(sid(0x22)),
            42,
            b"tls record".to_vec(),
        );
        let parsed = Packet::parse(&pkt.to_bytes()).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn test_control_roundtrip_empty_acks() {
        let pkt = Packet::control(
            Opcode::ControlHardResetClientV2,
            0,
            sid(0xaa),
            Vec::new(),
            None,
            0,
            Vec::new(),
        );
        let parsed = Packet::parse(&pkt.to_bytes()).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn test_control_roundtrip_max_acks() {
        let acks: Vec<u32> = (0..255).collect();
        let pkt = Packet::control(
            Opcode::ControlV1,
            3,
            sid(0x01),
            acks,
            Some(sid(0x02)),
            256,
            vec![0xff; 64],
        );
        let parsed = Packet::parse(&pkt.to_bytes()).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn test_ack_roundtrip() {
        let pkt = Packet::ack(0, sid(0x33), vec![5], sid(0x44));
        let wire = pkt.to_bytes();
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed, pkt);
        // ACK packets carry no packet id of their own.
        assert_eq!(wire.len(), 1 + 8 + 1 + 4 + 8);
    }

    #[test]
    fn test_data_roundtrip() {
        let pkt = Packet::data(2, vec![1, 2, 3, 4]);
        let wire = pkt.to_bytes();
        assert_eq!(wire[0], OPCODE_DATA_V1 << 3 | 2);
        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn test_parse_rejects_unknown_opcode() {
        // Opcode 3 is SOFT_RESET, which this client does not speak.
        let err = Packet::parse(&[3 << 3]).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let pkt = Packet::control(
            Opcode::ControlV1,
            0,
            sid(0x11),
            vec![9],
            Some(sid(0x22)),
            1,
            Vec::new(),
        );
        let wire = pkt.to_bytes();
        for cut in 1..wire.len() {
            assert!(
                Packet::parse(&wire[..cut]).is_err(),
                "truncation at {cut} accepted"
            );
        }
    }
}
