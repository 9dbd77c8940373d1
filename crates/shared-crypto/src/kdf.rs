//! # Key Derivation
//!
//! PBKDF2-HMAC-SHA256 derivation of the vault key from the operator's master
//! passphrase. The salt is random per vault file, so identical passphrases
//! never produce identical keys across installations.

use crate::symmetric::SecretKey;
use crate::CryptoError;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// PBKDF2 iteration count. High enough to slow offline guessing of the
/// master passphrase; derivation happens once at boot.
pub const KDF_ITERATIONS: u32 = 600_000;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Derive a 256-bit secret key from a passphrase and salt.
///
/// # Errors
///
/// Returns `CryptoError::InvalidSaltLength` if the salt is not [`SALT_LEN`]
/// bytes, and `CryptoError::InvalidInput` for an empty passphrase.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<SecretKey, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::InvalidInput(
            "master passphrase must not be empty".to_string(),
        ));
    }
    if salt.len() != SALT_LEN {
        return Err(CryptoError::InvalidSaltLength {
            expected: SALT_LEN,
            actual: salt.len(),
        });
    }

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ITERATIONS, &mut key);
    Ok(SecretKey::from_bytes(key))
}

/// Generate a random salt for a new vault file.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
    salt
}
