//! OpenVPN wire protocol constants.

/// Initial key from client, key-method 2.
pub const OPCODE_CONTROL_HARD_RESET_CLIENT_V2: u8 = 7;
/// Initial key from server, key-method 2.
pub const OPCODE_CONTROL_HARD_RESET_SERVER_V2: u8 = 8;
/// Control channel packet, usually TLS ciphertext.
pub const OPCODE_CONTROL_V1: u8 = 4;
/// Acknowledgement for packets received.
pub const OPCODE_ACK_V1: u8 = 5;
/// Data channel packet.
pub const OPCODE_DATA_V1: u8 = 6;

/// Session identifiers are 8 random bytes.
pub const SESSION_ID_LEN: usize = 8;

/// Maximum entries in one ACK list (one length byte on the wire).
pub const MAX_ACKS_PER_PACKET: usize = 255;

/// Upper bound for a single control-packet payload; TLS records larger than
/// this are chunked across several CONTROL_V1 packets.
pub const MAX_CONTROL_PAYLOAD: usize = 1024;

/// Receive buffer sizing for one wire packet.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Width of the data-channel replay window.
pub const REPLAY_WINDOW_SIZE: u32 = 64;

/// The canonical OpenVPN data-channel ping payload.
pub const PING_MAGIC: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7, 0x48,
];

/// Marker byte carried in front of the payload when the no-op compression
/// stub is negotiated.
pub const NO_COMPRESS_BYTE: u8 = 0xfa;
