//! # RX-01 Credential Vault
//!
//! Authenticated encryption at rest for (service, key, secret) triples: the
//! exchange API credentials and the envelope HMAC secrets.
//!
//! ## File format
//!
//! ```text
//! magic "RXVLT" | version u8 | salt [16] | nonce [24] | ciphertext+tag
//! ```
//!
//! The vault key is PBKDF2-HMAC-SHA256(passphrase, salt); the ciphertext is
//! XChaCha20-Poly1305 over the bincode-encoded credential map. Every save
//! draws a fresh salt and nonce.
//!
//! ## Failure modes
//!
//! - Missing passphrase: hard refusal at boot, before any file I/O.
//! - Tamper (any flipped bit): AEAD tag fails, hard refusal.
//! - Rotation: new temp file + atomic rename; a reader sees the old vault or
//!   the new one, never a partial write.
//!
//! Secrets live in memory only while the process runs and are zeroized on
//! drop. They are never logged.

#![warn(missing_docs)]

pub mod vault;

pub use vault::{Credential, CredentialVault, VaultError};
