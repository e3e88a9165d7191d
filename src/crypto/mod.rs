//! Cryptographic utilities: randomness helpers, the TLS 1.0 PRF, and the
//! data-channel key schedule.

mod keys;
mod prf;

pub use keys::KeyBlock;
pub(crate) use prf::hmac_digest;
pub use prf::tls1_prf;

/// Generate random bytes using a cryptographically secure RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate random bytes into a slice.
pub fn fill_random(dest: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(dest);
}
