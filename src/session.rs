//! Mutable state tied to one VPN session: identifiers, counters, key slots.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::random_bytes;
use crate::error::{Error, Result};
use crate::protocol::SESSION_ID_LEN;

/// Number of key slots a session carries; the key id field is 3 bits wide.
pub const KEY_SLOTS: usize = 8;

/// An 8-byte session identifier. Each peer picks its own at random; once
/// exchanged, both ids appear in every control packet.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn random() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The random material one peer contributes to the key schedule.
///
/// The pre-master secret is only ever present on the client side; a remote
/// key source parsed from the server carries zeroes there.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySource {
    pub pre_master: [u8; 48],
    pub random1: [u8; 32],
    pub random2: [u8; 32],
}

impl KeySource {
    /// Generate a full local key source, pre-master included.
    pub fn generate() -> Self {
        Self {
            pre_master: random_bytes(),
            random1: random_bytes(),
            random2: random_bytes(),
        }
    }

    /// Assemble a key source from raw parts.
    pub fn from_parts(pre_master: [u8; 48], random1: [u8; 32], random2: [u8; 32]) -> Self {
        Self {
            pre_master,
            random1,
            random2,
        }
    }

    /// A remote key source: the peer's randoms, no pre-master.
    pub fn from_remote(random1: [u8; 32], random2: [u8; 32]) -> Self {
        Self {
            pre_master: [0u8; 48],
            random1,
            random2,
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        f.write_str("KeySource(..)")
    }
}

/// One key slot: local material from session start, remote material added
/// exactly once after the server's control message.
#[derive(Clone)]
pub struct DataChannelKey {
    pub local: KeySource,
    pub remote: Option<KeySource>,
}

impl DataChannelKey {
    pub fn new(local: KeySource) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    /// Record the remote key source. Fails if already present.
    pub fn add_remote(&mut self, remote: KeySource) -> Result<()> {
        if self.remote.is_some() {
            return Err(Error::handshake("remote key material already present"));
        }
        self.remote = Some(remote);
        Ok(())
    }

    /// The slot is ready once both sides' material is present.
    pub fn ready(&self) -> bool {
        self.remote.is_some()
    }
}

struct KeyRing {
    slots: [Option<DataChannelKey>; KEY_SLOTS],
    active: usize,
}

/// Per-session mutable state.
///
/// The control packet-id counter advances atomically so one reader and one
/// writer can share the session without extra locking.
pub struct Session {
    local_session_id: SessionId,
    remote_session_id: Mutex<Option<SessionId>>,
    local_key_id: u8,
    control_packet_id_out: AtomicU32,
    keys: Mutex<KeyRing>,
}

impl Session {
    /// Create a session with a fresh id and local key material in slot 0.
    pub fn new() -> Self {
        let mut slots: [Option<DataChannelKey>; KEY_SLOTS] = std::array::from_fn(|_| None);
        slots[0] = Some(DataChannelKey::new(KeySource::generate()));
        Self {
            local_session_id: SessionId::random(),
            remote_session_id: Mutex::new(None),
            local_key_id: 0,
            control_packet_id_out: AtomicU32::new(0),
            keys: Mutex::new(KeyRing { slots, active: 0 }),
        }
    }

    pub fn local_session_id(&self) -> SessionId {
        self.local_session_id
    }

    pub fn remote_session_id(&self) -> Option<SessionId> {
        *self.remote_session_id.lock().unwrap()
    }

    /// Record the server's session id. It never changes for the lifetime of
    /// the session; a second, different id is rejected.
    pub fn set_remote_session_id(&self, sid: SessionId) -> Result<()> {
        let mut guard = self.remote_session_id.lock().unwrap();
        match *guard {
            None => {
                *guard = Some(sid);
                Ok(())
            }
            Some(existing) if existing == sid => Ok(()),
            Some(_) => Err(Error::handshake("remote session id changed mid-session")),
        }
    }

    /// Allocate the next outbound control packet id. Starts at 0 and is
    /// strictly increasing.
    pub fn next_control_packet_id(&self) -> u32 {
        self.control_packet_id_out.fetch_add(1, Ordering::SeqCst)
    }

    pub fn local_key_id(&self) -> u8 {
        self.local_key_id
    }

    /// A copy of the active key slot.
    pub fn active_key(&self) -> Result<DataChannelKey> {
        let keys = self.keys.lock().unwrap();
        keys.slots[keys.active].clone().ok_or(Error::NoActiveKey)
    }

    /// Add the server's key source to the active slot, exactly once.
    pub fn add_remote_key(&self, remote: KeySource) -> Result<()> {
        let mut keys = self.keys.lock().unwrap();
        let active = keys.active;
        match keys.slots[active].as_mut() {
            Some(slot) => slot.add_remote(remote),
            None => Err(Error::NoActiveKey),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_packet_ids_strictly_increase_from_zero() {
        let session = Session::new();
        for expected in 0..32 {
            assert_eq!(session.next_control_packet_id(), expected);
        }
    }

    #[test]
    fn test_remote_session_id_is_write_once() {
        let session = Session::new();
        let first = SessionId::from_bytes([1; 8]);
        session.set_remote_session_id(first).unwrap();
        // Idempotent for the same id.
        session.set_remote_session_id(first).unwrap();
        assert_eq!(session.remote_session_id(), Some(first));

        let err = session
            .set_remote_session_id(SessionId::from_bytes([2; 8]))
            .unwrap_err();
        assert!(matches!(err, Error::BadHandshake(_)));
        assert_eq!(session.remote_session_id(), Some(first));
    }

    #[test]
    fn test_active_key_holds_local_material() {
        let session = Session::new();
        let key = session.active_key().unwrap();
        assert!(!key.ready());
        assert_ne!(key.local.pre_master, [0u8; 48]);
    }

    #[test]
    fn test_remote_key_added_exactly_once() {
        let session = Session::new();
        session
            .add_remote_key(KeySource::from_remote([1; 32], [2; 32]))
            .unwrap();
        assert!(session.active_key().unwrap().ready());

        let err = session
            .add_remote_key(KeySource::from_remote([3; 32], [4; 32]))
            .unwrap_err();
        assert!(matches!(err, Error::BadHandshake(_)));
    }

    #[test]
    fn test_session_ids_are_distinct() {
        assert_ne!(
            Session::new().local_session_id(),
            Session::new().local_session_id()
        );
    }
}
