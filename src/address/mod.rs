//! Monero-style address decoding: a block-wise base58 variant (not the
//! contiguous-integer base58 that crates like `bs58` implement) followed by
//! a truncated Keccak-256 checksum.

use num_bigint::BigUint;
use num_traits::Zero;
use sha3::{Digest, Keccak256};

const ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const FULL_BLOCK_SIZE: usize = 8;
const FULL_ENCODED_BLOCK_SIZE: usize = 11;
// encoded character count for a 0..=8 byte block
const ENCODED_BLOCK_SIZES: [usize; 9] = [0, 2, 3, 5, 6, 7, 9, 10, 11];

fn decoded_block_size(encoded_len: usize) -> Option<usize> {
    ENCODED_BLOCK_SIZES.iter().position(|&n| n == encoded_len)
}

fn alphabet_index(c: u8) -> Option<u64> {
    ALPHABET.iter().position(|&a| a == c).map(|i| i as u64)
}

fn decode_block(encoded: &[u8], expected_bytes: usize) -> Option<Vec<u8>> {
    let mut value = BigUint::zero();
    let base = BigUint::from(58u32);
    for &c in encoded {
        let digit = alphabet_index(c)?;
        value = value * &base + BigUint::from(digit);
    }
    let mut bytes = value.to_bytes_be();
    if bytes.len() > expected_bytes {
        return None;
    }
    if bytes.len() < expected_bytes {
        let mut padded = vec![0u8; expected_bytes - bytes.len()];
        padded.append(&mut bytes);
        bytes = padded;
    }
    Some(bytes)
}

/// Decodes Monero's block-wise base58 encoding. Input is processed in
/// 11-character blocks (each representing 8 raw bytes) plus a final
/// remainder block.
pub fn decode_base58(s: &str) -> Option<Vec<u8>> {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return Some(Vec::new());
    }
    let full_blocks = bytes.len() / FULL_ENCODED_BLOCK_SIZE;
    let last_block_len = bytes.len() % FULL_ENCODED_BLOCK_SIZE;

    let mut out = Vec::with_capacity(full_blocks * FULL_BLOCK_SIZE + FULL_BLOCK_SIZE);
    for i in 0..full_blocks {
        let chunk = &bytes[i * FULL_ENCODED_BLOCK_SIZE..(i + 1) * FULL_ENCODED_BLOCK_SIZE];
        out.extend(decode_block(chunk, FULL_BLOCK_SIZE)?);
    }
    if last_block_len > 0 {
        let expected = decoded_block_size(last_block_len)?;
        let chunk = &bytes[full_blocks * FULL_ENCODED_BLOCK_SIZE..];
        out.extend(decode_block(chunk, expected)?);
    }
    Some(out)
}

fn keccak_checksum(data: &[u8]) -> [u8; 4] {
    let digest = Keccak256::digest(data);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// Validates a Monero-family address string against the configured address
/// and subaddress prefixes (raw leading bytes, as configured in `config.json`).
pub fn is_address_valid(addr: &str, addr_prefix: &[u8], subaddr_prefix: &[u8]) -> bool {
    let Some(decoded) = decode_base58(addr) else { return false };
    if decoded.len() < 64 + 4 + 1 {
        return false;
    }
    let (data, checksum) = decoded.split_at(decoded.len() - 4);
    if keccak_checksum(data) != checksum {
        return false;
    }
    for prefix in [addr_prefix, subaddr_prefix] {
        if !prefix.is_empty() && data.starts_with(prefix) && data.len() == prefix.len() + 64 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_empty() {
        assert_eq!(decode_base58(""), Some(Vec::new()));
    }

    #[test]
    fn rejects_non_alphabet_char() {
        assert!(decode_base58("0OIl").is_none());
    }

    #[test]
    fn invalid_address_rejected() {
        assert!(!is_address_valid("not-an-address", &[18], &[42]));
    }

    #[test]
    fn too_short_decoded_payload_rejected() {
        // A syntactically valid base58 string that decodes far too short.
        assert!(!is_address_valid("111111", &[18], &[42]));
    }
}
