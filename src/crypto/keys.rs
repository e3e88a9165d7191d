//! The OpenVPN key-method 2 key schedule.
//!
//! Two PRF expansions turn the exchanged key sources into a 256-byte key
//! block: a 48-byte master secret over both sides' first randoms, then the
//! block itself over the second randoms and both session ids. The block is
//! sliced into four 64-byte slots: client cipher key, client HMAC key,
//! server cipher key, server HMAC key.

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::prf::tls1_prf;
use crate::error::{Error, Result};
use crate::session::{DataChannelKey, SessionId};

const MASTER_LEN: usize = 48;
const SLOT_LEN: usize = 64;

/// Full derived key block length.
pub const KEY_BLOCK_LEN: usize = 4 * SLOT_LEN;

const LABEL_MASTER: &[u8] = b"OpenVPN master secret";
const LABEL_EXPANSION: &[u8] = b"OpenVPN key expansion";

/// The derived data-channel key block.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyBlock {
    block: [u8; KEY_BLOCK_LEN],
}

impl std::fmt::Debug for KeyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBlock").finish_non_exhaustive()
    }
}

impl KeyBlock {
    /// Run the key schedule over a ready key slot.
    ///
    /// `key.local` is the client contribution (pre-master included),
    /// `key.remote` the server's.
    pub fn derive(
        key: &DataChannelKey,
        client_sid: SessionId,
        server_sid: SessionId,
    ) -> Result<KeyBlock> {
        let remote = key
            .remote
            .as_ref()
            .ok_or_else(|| Error::handshake("data channel key slot not ready"))?;

        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(&key.local.random1);
        seed.extend_from_slice(&remote.random1);
        let mut master = tls1_prf(&key.local.pre_master, LABEL_MASTER, &seed, MASTER_LEN);

        seed.clear();
        seed.extend_from_slice(&key.local.random2);
        seed.extend_from_slice(&remote.random2);
        seed.extend_from_slice(client_sid.as_bytes());
        seed.extend_from_slice(server_sid.as_bytes());
        let mut expanded = tls1_prf(&master, LABEL_EXPANSION, &seed, KEY_BLOCK_LEN);
        master.zeroize();

        let mut block = [0u8; KEY_BLOCK_LEN];
        block.copy_from_slice(&expanded);
        expanded.zeroize();
        Ok(KeyBlock { block })
    }

    pub fn client_cipher_key(&self) -> &[u8] {
        &self.block[..SLOT_LEN]
    }

    pub fn client_hmac_key(&self) -> &[u8] {
        &self.block[SLOT_LEN..2 * SLOT_LEN]
    }

    pub fn server_cipher_key(&self) -> &[u8] {
        &self.block[2 * SLOT_LEN..3 * SLOT_LEN]
    }

    pub fn server_hmac_key(&self) -> &[u8] {
        &self.block[3 * SLOT_LEN..]
    }
}
