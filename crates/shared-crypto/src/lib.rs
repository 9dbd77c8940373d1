//! # Shared Crypto - Cryptographic Primitives
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `symmetric` | XChaCha20-Poly1305 | Credential vault at-rest encryption |
//! | `kdf` | PBKDF2-HMAC-SHA256 | Master-passphrase key derivation |
//! | `hashing` | SHA-256 | Canonical policy digests |
//!
//! ## Security Properties
//!
//! - **XChaCha20**: 192-bit nonce, constant-time, side-channel immune
//! - **PBKDF2**: 600k iterations, per-file random salt
//! - **SHA-256**: stable digests over canonical JSON serializations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod errors;
pub mod hashing;
pub mod kdf;
pub mod symmetric;

// Re-exports
pub use errors::CryptoError;
pub use hashing::{digest_from_hex, sha256, sha256_hex, Digest32};
pub use kdf::{derive_key, generate_salt, KDF_ITERATIONS, SALT_LEN};
pub use symmetric::{decrypt, encrypt, Nonce, SecretKey};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
    }
}
