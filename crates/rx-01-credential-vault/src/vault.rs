//! Vault implementation.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use shared_crypto::{decrypt, derive_key, encrypt, generate_salt, Nonce, SALT_LEN};

/// File magic.
pub const MAGIC: &[u8; 5] = b"RXVLT";

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

/// Vault failures. All of them are hard refusals; there is no degraded mode.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No master passphrase was provided.
    #[error("Master passphrase missing; refusing to start")]
    MissingPassphrase,

    /// I/O failure reading or writing the vault file.
    #[error("Vault I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a vault or is truncated.
    #[error("Vault file corrupt: {0}")]
    Corrupt(String),

    /// Authentication tag mismatch: wrong passphrase or tampered file.
    #[error("Vault authentication failed (wrong passphrase or tampered file)")]
    Tampered,

    /// Another process holds the vault.
    #[error("Vault file locked by another process")]
    Locked,

    /// Underlying crypto failure.
    #[error(transparent)]
    Crypto(#[from] shared_crypto::CryptoError),
}

/// One stored credential pair. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    /// API key / identifier half.
    pub key: String,
    /// Secret half.
    pub secret: String,
}

impl std::fmt::Debug for Credential {
    // Secrets never reach logs, including via Debug formatting.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The open vault: a decrypted credential map bound to its backing file.
pub struct CredentialVault {
    path: PathBuf,
    passphrase: String,
    entries: BTreeMap<String, Credential>,
    /// Held for the vault's lifetime to keep rotations single-writer.
    _lock: std::fs::File,
}

impl std::fmt::Debug for CredentialVault {
    // Secrets never reach logs, including via Debug formatting.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("path", &self.path)
            .field("passphrase", &"<redacted>")
            .field("entries", &self.entries)
            .finish()
    }
}

impl CredentialVault {
    /// Create a new vault file with the given entries.
    ///
    /// Fails if the file already exists; rotation goes through
    /// [`Self::insert`] + [`Self::save`] on an open vault.
    pub fn create(
        path: &Path,
        passphrase: &str,
        entries: BTreeMap<String, Credential>,
    ) -> Result<Self, VaultError> {
        if passphrase.is_empty() {
            return Err(VaultError::MissingPassphrase);
        }
        if path.exists() {
            return Err(VaultError::Corrupt(format!(
                "{} already exists",
                path.display()
            )));
        }
        let lock = Self::acquire_lock(path)?;
        let vault = Self {
            path: path.to_path_buf(),
            passphrase: passphrase.to_string(),
            entries,
            _lock: lock,
        };
        vault.save()?;
        info!(path = %path.display(), "Credential vault created");
        Ok(vault)
    }

    /// Open and decrypt an existing vault.
    pub fn open(path: &Path, passphrase: &str) -> Result<Self, VaultError> {
        if passphrase.is_empty() {
            return Err(VaultError::MissingPassphrase);
        }
        let lock = Self::acquire_lock(path)?;
        let bytes = std::fs::read(path)?;
        let entries = Self::decode(&bytes, passphrase)?;
        info!(path = %path.display(), services = entries.len(), "Credential vault opened");
        Ok(Self {
            path: path.to_path_buf(),
            passphrase: passphrase.to_string(),
            entries,
            _lock: lock,
        })
    }

    /// Look up a service's credentials.
    #[must_use]
    pub fn get(&self, service: &str) -> Option<&Credential> {
        self.entries.get(service)
    }

    /// Service names present in the vault.
    #[must_use]
    pub fn services(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Insert or replace a credential in memory. Not durable until
    /// [`Self::save`].
    pub fn insert(&mut self, service: &str, key: &str, secret: &str) {
        self.entries.insert(
            service.to_string(),
            Credential {
                key: key.to_string(),
                secret: secret.to_string(),
            },
        );
    }

    /// Remove a credential in memory. Not durable until [`Self::save`].
    pub fn remove(&mut self, service: &str) -> bool {
        self.entries.remove(service).is_some()
    }

    /// Re-encrypt and atomically replace the vault file.
    ///
    /// Fresh salt and nonce every save; temp-file + rename keeps the old
    /// vault intact until the new one is fully durable.
    pub fn save(&self) -> Result<(), VaultError> {
        let plaintext =
            bincode::serialize(&self.entries).map_err(|e| VaultError::Corrupt(e.to_string()))?;

        let salt = generate_salt();
        let key = derive_key(&self.passphrase, &salt)?;
        let (ciphertext, nonce) = encrypt(&key, &plaintext)?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&salt);
        bytes.extend_from_slice(nonce.as_bytes());
        bytes.extend_from_slice(&ciphertext);

        let temp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&temp)?;
            Self::restrict_permissions(&file)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn decode(bytes: &[u8], passphrase: &str) -> Result<BTreeMap<String, Credential>, VaultError> {
        if bytes.len() < HEADER_LEN {
            return Err(VaultError::Corrupt("file shorter than header".to_string()));
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(VaultError::Corrupt("bad magic".to_string()));
        }
        let version = bytes[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(VaultError::Corrupt(format!(
                "unsupported format version {version}"
            )));
        }
        let salt = &bytes[MAGIC.len() + 1..MAGIC.len() + 1 + SALT_LEN];
        let nonce = Nonce::from_slice(&bytes[MAGIC.len() + 1 + SALT_LEN..HEADER_LEN])?;
        let ciphertext = &bytes[HEADER_LEN..];

        let key = derive_key(passphrase, salt)?;
        let plaintext = decrypt(&key, ciphertext, &nonce).map_err(|_| VaultError::Tampered)?;
        bincode::deserialize(&plaintext).map_err(|e| VaultError::Corrupt(e.to_string()))
    }

    fn acquire_lock(path: &Path) -> Result<std::fs::File, VaultError> {
        let lock_path = path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = std::fs::File::create(&lock_path)?;
        lock.try_lock_exclusive().map_err(|_| VaultError::Locked)?;
        Ok(lock)
    }

    #[cfg(unix)]
    fn restrict_permissions(file: &std::fs::File) -> Result<(), VaultError> {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn restrict_permissions(_file: &std::fs::File) -> Result<(), VaultError> {
        Ok(())
    }
}
