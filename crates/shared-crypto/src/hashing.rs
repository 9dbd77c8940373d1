//! # Hashing
//!
//! SHA-256 digests for canonical policy serializations and other stable
//! fingerprints. The digest of a canonical byte string must be identical
//! across processes and restarts; that parity is what the policy handshake
//! relies on.

use sha2::{Digest, Sha256};

/// A 32-byte digest.
pub type Digest32 = [u8; 32];

/// Compute the SHA-256 digest of a byte string.
pub fn sha256(bytes: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Compute the SHA-256 digest and render it as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

/// Parse a 64-char lowercase hex string into a digest.
pub fn digest_from_hex(s: &str) -> Option<Digest32> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}
