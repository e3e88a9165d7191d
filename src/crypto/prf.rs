//! The TLS 1.0 pseudo-random function.
//!
//! OpenVPN's key-method 2 derives data-channel keys with the classic
//! SSL/TLS PRF: the secret is split in two halves, expanded with
//! P_MD5 and P_SHA1 respectively, and the streams are XORed together.

use hmac::digest::core_api::BlockSizeUser;
use hmac::digest::Digest;
use hmac::{Mac, SimpleHmac};
use md5::Md5;
use sha1::Sha1;

pub(crate) fn hmac_digest<D>(secret: &[u8], parts: &[&[u8]]) -> Vec<u8>
where
    D: Digest + BlockSizeUser + Clone,
{
    let mut mac =
        SimpleHmac::<D>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// P_hash from RFC 2246 §5: iterate HMAC over the seed until `out` is full.
fn p_hash<D>(secret: &[u8], seed: &[u8], out: &mut [u8])
where
    D: Digest + BlockSizeUser + Clone,
{
    let mut a = hmac_digest::<D>(secret, &[seed]); // A(1)
    let mut pos = 0;
    while pos < out.len() {
        let chunk = hmac_digest::<D>(secret, &[&a, seed]);
        let n = chunk.len().min(out.len() - pos);
        out[pos..pos + n].copy_from_slice(&chunk[..n]);
        pos += n;
        a = hmac_digest::<D>(secret, &[&a]); // A(i+1)
    }
}

/// PRF(secret, label, seed) = P_MD5(S1, label ‖ seed) ⊕ P_SHA1(S2, label ‖ seed).
pub fn tls1_prf(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    // The two halves share the middle byte when the secret length is odd.
    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let mut out = vec![0u8; out_len];
    let mut sha_part = vec![0u8; out_len];
    p_hash::<Md5>(s1, &label_seed, &mut out);
    p_hash::<Sha1>(s2, &label_seed, &mut sha_part);
    for (o, s) in out.iter_mut().zip(sha_part.iter()) {
        *o ^= s;
    }
    out
}
