//! SHA-256 hex helpers shared by the audit chain, budget ledger, cache
//! keys, and de-identification transforms.

use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// First `len` hex characters of the SHA-256 digest.
pub fn sha256_hex_truncated(data: &[u8], len: usize) -> String {
    let mut hex = sha256_hex(data);
    hex.truncate(len);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_truncation() {
        assert_eq!(sha256_hex_truncated(b"abc", 16), "ba7816bf8f01cfea");
        assert_eq!(sha256_hex_truncated(b"abc", 64).len(), 64);
    }
}
