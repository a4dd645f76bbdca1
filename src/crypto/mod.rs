//! Frame sealing (C1) and proof-of-work arithmetic shared by the slave and
//! master binaries.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::PoolError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Derives the fixed 32-byte AEAD key from the operator-configured shared
/// secret. The raw passphrase is never used directly as key material.
pub fn derive_master_key(master_pass: &str) -> [u8; 32] {
    let digest = Sha256::digest(master_pass.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Seals `plaintext` as `nonce || ciphertext_with_tag`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("XChaCha20-Poly1305 encryption is infallible for valid keys");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Opens a sealed record produced by [`seal`]. Any tamper or truncation is a
/// hard failure; there is no partial result.
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, PoolError> {
    if sealed.len() < NONCE_LEN {
        return Err(PoolError::Crypto("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| PoolError::Crypto("AEAD authentication failed".into()))
}

/// Treats a 32-byte hash as a little-endian 256-bit integer `H` and returns
/// `floor((2^256 - 1) / H)`, saturating to `u64::MAX` for results that would
/// overflow (a hash of all zero bits, effectively infinite difficulty) or
/// not fit in 64 bits (an extremely small `H`).
pub fn hash_to_diff(hash: &[u8; 32]) -> u64 {
    let h = BigUint::from_bytes_le(hash);
    if h.is_zero() {
        return u64::MAX;
    }
    let max = (BigUint::one() << 256) - BigUint::one();
    let diff = max / h;
    diff.try_into().unwrap_or(u64::MAX)
}

/// 4-byte little-endian truncation of `floor(2^64 / diff)`, used in
/// NiceHash/XMRig job notifications.
pub fn diff_to_short_target(diff: u64) -> [u8; 4] {
    let target: u64 = if diff == 0 { u64::MAX } else { (u64::MAX as u128 / diff as u128) as u64 };
    let full = target.to_le_bytes();
    [full[4], full[5], full[6], full[7]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = derive_master_key("correct horse battery staple");
        let msg = b"share batch payload";
        let sealed = seal(&key, msg);
        assert_eq!(sealed.len(), msg.len() + SEAL_OVERHEAD);
        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn tamper_fails_open() {
        let key = derive_master_key("secret");
        let mut sealed = seal(&key, b"hello world");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn wrong_key_fails_open() {
        let sealed = seal(&derive_master_key("a"), b"payload");
        assert!(open(&derive_master_key("b"), &sealed).is_err());
    }

    #[test]
    fn hash_to_diff_monotonic() {
        let mut small_hash = [0xFFu8; 32];
        small_hash[31] = 0x7F;
        let large_hash = [0x01u8; 32];
        assert!(hash_to_diff(&large_hash) > hash_to_diff(&small_hash));
    }
}
