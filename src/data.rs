//! Data-channel encryption, authentication, sequencing, and replay
//! protection.
//!
//! Two envelope formats are supported, matching OpenVPN 2.x:
//!
//! AEAD (AES-GCM):
//! ```text
//! [opcode:5|key_id:3] [packet_id:4] [tag:16] [ciphertext]
//! ```
//! nonce = packet_id ‖ implicit IV (leading bytes of the HMAC-key slot),
//! AAD = opcode byte ‖ packet_id.
//!
//! CBC with HMAC:
//! ```text
//! [opcode:5|key_id:3] [hmac] [iv:16] [ciphertext]
//! ```
//! plaintext = packet_id ‖ [stub byte] ‖ payload, HMAC over iv ‖ ciphertext.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::{AuthDigest, Cipher, Options};
use crate::crypto::{fill_random, hmac_digest, KeyBlock};
use crate::error::{Error, Result};
use crate::protocol::{Packet, NO_COMPRESS_BYTE, OPCODE_DATA_V1, REPLAY_WINDOW_SIZE};
use crate::session::{DataChannelKey, SessionId};
use crate::transport::Transport;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const GCM_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;
const IMPLICIT_IV_LEN: usize = 8;

/// Which end of the tunnel this channel encrypts for. Decides which half
/// of the key block feeds each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Sliding replay window over data packet-ids, bit 0 tracking the highest
/// accepted id.
pub struct ReplayWindow {
    highest: u32,
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: 0,
        }
    }

    /// Accept a packet id or fail with `Replay`. Call only after the packet
    /// authenticated.
    pub fn accept(&mut self, packet_id: u32) -> Result<()> {
        if packet_id == 0 {
            return Err(Error::Replay);
        }
        if packet_id > self.highest {
            let shift = packet_id - self.highest;
            self.bitmap = if shift >= 64 { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.highest = packet_id;
            return Ok(());
        }
        let behind = self.highest - packet_id;
        if behind >= REPLAY_WINDOW_SIZE {
            return Err(Error::Replay);
        }
        if self.bitmap >> behind & 1 == 1 {
            return Err(Error::Replay);
        }
        self.bitmap |= 1 << behind;
        Ok(())
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

enum Crypter {
    Gcm128(Aes128Gcm),
    Gcm256(Aes256Gcm),
    /// Raw AES key; the CBC mode needs a fresh instance per IV.
    Cbc(Vec<u8>),
}

struct DirectionKeys {
    crypter: Crypter,
    hmac_key: Vec<u8>,
    implicit_iv: [u8; IMPLICIT_IV_LEN],
}

fn direction_keys(
    cipher: Cipher,
    digest: AuthDigest,
    cipher_slot: &[u8],
    hmac_slot: &[u8],
) -> Result<DirectionKeys> {
    let key = &cipher_slot[..cipher.key_len()];
    let crypter = match cipher {
        Cipher::Aes128Gcm => Crypter::Gcm128(
            Aes128Gcm::new_from_slice(key)
                .map_err(|_| Error::handshake("cipher key slot too short"))?,
        ),
        Cipher::Aes256Gcm => Crypter::Gcm256(
            Aes256Gcm::new_from_slice(key)
                .map_err(|_| Error::handshake("cipher key slot too short"))?,
        ),
        Cipher::Aes128Cbc | Cipher::Aes256Cbc => Crypter::Cbc(key.to_vec()),
    };
    let mut implicit_iv = [0u8; IMPLICIT_IV_LEN];
    implicit_iv.copy_from_slice(&hmac_slot[..IMPLICIT_IV_LEN]);
    Ok(DirectionKeys {
        crypter,
        hmac_key: hmac_slot[..digest.digest_len()].to_vec(),
        implicit_iv,
    })
}

/// The data channel: one outbound and one inbound keyed direction, written
/// once by the key schedule and shared between the reader and the writer.
pub struct DataChannel {
    cipher: Cipher,
    digest: AuthDigest,
    compress_stub: bool,
    key_id: u8,
    role: Role,
    tx: OnceLock<DirectionKeys>,
    rx: OnceLock<DirectionKeys>,
    tx_packet_id: AtomicU32,
    rx_replay: Mutex<ReplayWindow>,
    replay_drops: AtomicU64,
    auth_failures: AtomicU64,
}

impl DataChannel {
    pub fn new(options: &Options, key_id: u8, role: Role) -> Self {
        Self {
            cipher: options.cipher,
            digest: options.auth,
            compress_stub: options.compress_stub,
            key_id,
            role,
            tx: OnceLock::new(),
            rx: OnceLock::new(),
            tx_packet_id: AtomicU32::new(0),
            rx_replay: Mutex::new(ReplayWindow::new()),
            replay_drops: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
        }
    }

    /// Both directions are keyed and payload may flow.
    pub fn ready(&self) -> bool {
        self.tx.get().is_some() && self.rx.get().is_some()
    }

    /// Run the key schedule over a ready key slot and install both
    /// directional states. May be called once.
    pub fn setup_keys(
        &self,
        key: &DataChannelKey,
        client_sid: SessionId,
        server_sid: SessionId,
    ) -> Result<()> {
        let block = KeyBlock::derive(key, client_sid, server_sid)?;
        let (tx_cipher, tx_hmac, rx_cipher, rx_hmac) = match self.role {
            Role::Client => (
                block.client_cipher_key(),
                block.client_hmac_key(),
                block.server_cipher_key(),
                block.server_hmac_key(),
            ),
            Role::Server => (
                block.server_cipher_key(),
                block.server_hmac_key(),
                block.client_cipher_key(),
                block.client_hmac_key(),
            ),
        };
        let tx = direction_keys(self.cipher, self.digest, tx_cipher, tx_hmac)?;
        let rx = direction_keys(self.cipher, self.digest, rx_cipher, rx_hmac)?;
        self.tx
            .set(tx)
            .map_err(|_| Error::handshake("data channel keys already derived"))?;
        self.rx
            .set(rx)
            .map_err(|_| Error::handshake("data channel keys already derived"))?;
        Ok(())
    }

    fn opcode_byte(&self) -> u8 {
        OPCODE_DATA_V1 << 3 | self.key_id
    }

    /// Encrypt one payload into a complete wire packet (opcode byte
    /// included), consuming the next data packet-id.
    pub fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let keys = self.tx.get().ok_or(Error::NoActiveKey)?;
        let packet_id = self.tx_packet_id.fetch_add(1, Ordering::SeqCst) + 1;
        match &keys.crypter {
            Crypter::Gcm128(cipher) => self.seal_gcm(cipher, keys, packet_id, payload),
            Crypter::Gcm256(cipher) => self.seal_gcm(cipher, keys, packet_id, payload),
            Crypter::Cbc(key) => self.seal_cbc(key, keys, packet_id, payload),
        }
    }

    /// Encrypt one payload and send it over the transport. Returns the
    /// payload length, stream-style.
    pub fn write_packet(&self, transport: &dyn Transport, payload: &[u8]) -> Result<usize> {
        let wire = self.encrypt(payload)?;
        transport.write_packet(&wire)?;
        Ok(payload.len())
    }

    /// Authenticate, decrypt, and replay-check one received data packet.
    /// Replay and authentication failures are counted before propagating.
    pub fn read_packet(&self, packet: &Packet) -> Result<Vec<u8>> {
        let result = self.open(packet);
        match result {
            Err(Error::Replay) => {
                self.replay_drops.fetch_add(1, Ordering::Relaxed);
                Err(Error::Replay)
            }
            Err(Error::BadAuthentication) => {
                self.auth_failures.fetch_add(1, Ordering::Relaxed);
                Err(Error::BadAuthentication)
            }
            other => other,
        }
    }

    pub fn replay_drops(&self) -> u64 {
        self.replay_drops.load(Ordering::Relaxed)
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    fn open(&self, packet: &Packet) -> Result<Vec<u8>> {
        let keys = self.rx.get().ok_or(Error::NoActiveKey)?;
        if packet.key_id != self.key_id {
            debug!(key_id = packet.key_id, "data packet for unknown key epoch");
            return Err(Error::BadAuthentication);
        }
        let op_byte = packet.opcode.as_u8() << 3 | packet.key_id;
        let (packet_id, mut plaintext) = match &keys.crypter {
            Crypter::Gcm128(cipher) => self.open_gcm(cipher, keys, op_byte, &packet.payload)?,
            Crypter::Gcm256(cipher) => self.open_gcm(cipher, keys, op_byte, &packet.payload)?,
            Crypter::Cbc(key) => self.open_cbc(key, keys, &packet.payload)?,
        };
        self.rx_replay.lock().unwrap().accept(packet_id)?;
        if self.compress_stub && plaintext.first() == Some(&NO_COMPRESS_BYTE) {
            plaintext.remove(0);
        }
        Ok(plaintext)
    }

    fn seal_gcm<A: Aead>(
        &self,
        cipher: &A,
        keys: &DirectionKeys,
        packet_id: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let (nonce, aad) = self.gcm_nonce_aad(keys, packet_id);
        let mut plaintext = Vec::with_capacity(payload.len() + 1);
        if self.compress_stub {
            plaintext.push(NO_COMPRESS_BYTE);
        }
        plaintext.extend_from_slice(payload);

        let sealed = cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Io(std::io::Error::other("AEAD encryption failed")))?;
        let (body, tag) = sealed.split_at(sealed.len() - GCM_TAG_LEN);

        let mut wire = Vec::with_capacity(1 + 4 + sealed.len());
        wire.push(self.opcode_byte());
        wire.extend_from_slice(&packet_id.to_be_bytes());
        wire.extend_from_slice(tag);
        wire.extend_from_slice(body);
        Ok(wire)
    }

    fn open_gcm<A: Aead>(
        &self,
        cipher: &A,
        keys: &DirectionKeys,
        op_byte: u8,
        payload: &[u8],
    ) -> Result<(u32, Vec<u8>)> {
        if payload.len() < 4 + GCM_TAG_LEN {
            return Err(Error::BadAuthentication);
        }
        let packet_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let tag = &payload[4..4 + GCM_TAG_LEN];
        let body = &payload[4 + GCM_TAG_LEN..];

        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&payload[..4]);
        nonce[4..].copy_from_slice(&keys.implicit_iv);
        let mut aad = [0u8; 5];
        aad[0] = op_byte;
        aad[1..].copy_from_slice(&payload[..4]);

        let mut sealed = Vec::with_capacity(body.len() + GCM_TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);
        let plaintext = cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::BadAuthentication)?;
        Ok((packet_id, plaintext))
    }

    fn gcm_nonce_aad(&self, keys: &DirectionKeys, packet_id: u32) -> ([u8; 12], [u8; 5]) {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&packet_id.to_be_bytes());
        nonce[4..].copy_from_slice(&keys.implicit_iv);
        let mut aad = [0u8; 5];
        aad[0] = self.opcode_byte();
        aad[1..].copy_from_slice(&packet_id.to_be_bytes());
        (nonce, aad)
    }

    fn seal_cbc(
        &self,
        key: &[u8],
        keys: &DirectionKeys,
        packet_id: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let mut plaintext = Vec::with_capacity(4 + payload.len() + 1);
        plaintext.extend_from_slice(&packet_id.to_be_bytes());
        if self.compress_stub {
            plaintext.push(NO_COMPRESS_BYTE);
        }
        plaintext.extend_from_slice(payload);

        let mut iv = [0u8; CBC_IV_LEN];
        fill_random(&mut iv);
        let ciphertext = match self.cipher {
            Cipher::Aes128Cbc => Aes128CbcEnc::new_from_slices(key, &iv)
                .map_err(|_| Error::handshake("bad CBC key material"))?
                .encrypt_padded_vec_mut::<Pkcs7>(&plaintext),
            Cipher::Aes256Cbc => Aes256CbcEnc::new_from_slices(key, &iv)
                .map_err(|_| Error::handshake("bad CBC key material"))?
                .encrypt_padded_vec_mut::<Pkcs7>(&plaintext),
            _ => unreachable!("CBC seal with AEAD cipher"),
        };
        let mac = self.hmac(&keys.hmac_key, &iv, &ciphertext);

        let mut wire = Vec::with_capacity(1 + mac.len() + iv.len() + ciphertext.len());
        wire.push(self.opcode_byte());
        wire.extend_from_slice(&mac);
        wire.extend_from_slice(&iv);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    fn open_cbc(
        &self,
        key: &[u8],
        keys: &DirectionKeys,
        payload: &[u8],
    ) -> Result<(u32, Vec<u8>)> {
        let mac_len = self.digest.digest_len();
        if payload.len() < mac_len + CBC_IV_LEN + 16 {
            return Err(Error::BadAuthentication);
        }
        let mac = &payload[..mac_len];
        let iv = &payload[mac_len..mac_len + CBC_IV_LEN];
        let ciphertext = &payload[mac_len + CBC_IV_LEN..];
        if ciphertext.len() % 16 != 0 {
            return Err(Error::BadAuthentication);
        }

        let expected = self.hmac(&keys.hmac_key, iv, ciphertext);
        if !bool::from(expected.ct_eq(mac)) {
            return Err(Error::BadAuthentication);
        }

        let plaintext = match self.cipher {
            Cipher::Aes128Cbc => Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|_| Error::BadAuthentication)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| Error::BadAuthentication)?,
            Cipher::Aes256Cbc => Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|_| Error::BadAuthentication)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| Error::BadAuthentication)?,
            _ => unreachable!("CBC open with AEAD cipher"),
        };
        if plaintext.len() < 4 {
            return Err(Error::BadAuthentication);
        }
        let packet_id = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
        Ok((packet_id, plaintext[4..].to_vec()))
    }

    fn hmac(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
        match self.digest {
            AuthDigest::Sha1 => hmac_digest::<Sha1>(key, &[iv, ciphertext]),
            AuthDigest::Sha256 => hmac_digest::<Sha256>(key, &[iv, ciphertext]),
            AuthDigest::Sha512 => hmac_digest::<Sha512>(key, &[iv, ciphertext]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PING_MAGIC;
    use crate::session::KeySource;

    fn channel_pair(cipher: Cipher, digest: AuthDigest, stub: bool) -> (DataChannel, DataChannel) {
        let options = Options {
            cipher,
            auth: digest,
            compress_stub: stub,
            ..Default::default()
        };
        let mut key = DataChannelKey::new(KeySource::generate());
        key.add_remote(KeySource::from_remote(
            crate::crypto::random_bytes(),
            crate::crypto::random_bytes(),
        ))
        .unwrap();
        let client_sid = SessionId::random();
        let server_sid = SessionId::random();

        let client = DataChannel::new(&options, 0, Role::Client);
        client.setup_keys(&key, client_sid, server_sid).unwrap();
        let server = DataChannel::new(&options, 0, Role::Server);
        server.setup_keys(&key, client_sid, server_sid).unwrap();
        (client, server)
    }

    fn relay(wire: &[u8]) -> Packet {
        Packet::parse(wire).unwrap()
    }

    #[test]
    fn test_gcm_both_directions() {
        let (client, server) = channel_pair(Cipher::Aes256Gcm, AuthDigest::Sha256, false);

        let up = client.encrypt(b"client to server").unwrap();
        assert_eq!(server.read_packet(&relay(&up)).unwrap(), b"client to server");

        let down = server.encrypt(b"server to client").unwrap();
        assert_eq!(client.read_packet(&relay(&down)).unwrap(), b"server to client");
    }

    #[test]
    fn test_gcm_wire_layout() {
        let (client, _) = channel_pair(Cipher::Aes128Gcm, AuthDigest::Sha1, false);
        let payload = b"layout probe";
        let wire = client.encrypt(payload).unwrap();

        assert_eq!(wire[0], OPCODE_DATA_V1 << 3);
        // First data packet-id is 1.
        assert_eq!(&wire[1..5], &1u32.to_be_bytes());
        // opcode + id + tag + ciphertext, no padding in GCM.
        assert_eq!(wire.len(), 1 + 4 + GCM_TAG_LEN + payload.len());
    }

    #[test]
    fn test_cbc_both_directions() {
        let (client, server) = channel_pair(Cipher::Aes256Cbc, AuthDigest::Sha1, false);

        let up = client.encrypt(b"legacy mode").unwrap();
        assert_eq!(server.read_packet(&relay(&up)).unwrap(), b"legacy mode");

        let down = server.encrypt(b"still works").unwrap();
        assert_eq!(client.read_packet(&relay(&down)).unwrap(), b"still works");
    }

    #[test]
    fn test_replayed_packet_is_dropped_once_counted() {
        let (client, server) = channel_pair(Cipher::Aes256Gcm, AuthDigest::Sha256, false);
        let wire = client.encrypt(b"only once").unwrap();

        assert!(server.read_packet(&relay(&wire)).is_ok());
        let err = server.read_packet(&relay(&wire)).unwrap_err();
        assert!(matches!(err, Error::Replay));
        assert_eq!(server.replay_drops(), 1);
        assert_eq!(server.auth_failures(), 0);
    }

    #[test]
    fn test_replay_window_semantics() {
        let mut window = ReplayWindow::new();
        window.accept(100).unwrap();
        // Within the window, unseen: fine.
        window.accept(99).unwrap();
        window.accept(37).unwrap();
        // Seen again: replay.
        assert!(window.accept(99).is_err());
        assert!(window.accept(100).is_err());
        // At or beyond the window edge: replay.
        assert!(window.accept(100 - REPLAY_WINDOW_SIZE).is_err());
        // Id zero is never valid.
        assert!(window.accept(0).is_err());
        // Moving forward slides the window edge past old ids.
        window.accept(101).unwrap();
        assert!(window.accept(37).is_err());
    }

    #[test]
    fn test_tampered_packet_fails_authentication() {
        for cipher in [Cipher::Aes256Gcm, Cipher::Aes256Cbc] {
            let (client, server) = channel_pair(cipher, AuthDigest::Sha256, false);
            let mut wire = client.encrypt(b"integrity").unwrap();
            let last = wire.len() - 1;
            wire[last] ^= 0x01;
            let err = server.read_packet(&relay(&wire)).unwrap_err();
            assert!(matches!(err, Error::BadAuthentication));
            assert_eq!(server.auth_failures(), 1);
        }
    }

    #[test]
    fn test_wrong_key_epoch_rejected() {
        let (client, server) = channel_pair(Cipher::Aes256Gcm, AuthDigest::Sha256, false);
        let mut wire = client.encrypt(b"epoch").unwrap();
        wire[0] = OPCODE_DATA_V1 << 3 | 1;
        assert!(matches!(
            server.read_packet(&relay(&wire)).unwrap_err(),
            Error::BadAuthentication
        ));
    }

    #[test]
    fn test_compression_stub_byte_roundtrip() {
        for cipher in [Cipher::Aes128Gcm, Cipher::Aes128Cbc] {
            let (client, server) = channel_pair(cipher, AuthDigest::Sha1, true);
            let wire = client.encrypt(b"stubbed").unwrap();
            assert_eq!(server.read_packet(&relay(&wire)).unwrap(), b"stubbed");
        }
    }

    #[test]
    fn test_packet_ids_advance_per_packet() {
        let (client, _) = channel_pair(Cipher::Aes256Gcm, AuthDigest::Sha256, false);
        for expected in 1u32..=4 {
            let wire = client.encrypt(&PING_MAGIC).unwrap();
            assert_eq!(&wire[1..5], &expected.to_be_bytes());
        }
    }

    #[test]
    fn test_encrypt_before_keys_fails() {
        let options = Options::default();
        let channel = DataChannel::new(&options, 0, Role::Client);
        assert!(matches!(
            channel.encrypt(b"x").unwrap_err(),
            Error::NoActiveKey
        ));
    }
}
