//! OpenVPN wire protocol.
//!
//! This module contains:
//! - Opcodes and magic values
//! - Packet: header codec shared by the control and data channels

mod constants;
mod packet;

pub use constants::*;
pub use packet::{Opcode, Packet};
