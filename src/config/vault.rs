//! Credential Vault
//!
//! Symmetric encryption of secrets at rest (host passwords, private keys).
//!
//! - Key: Argon2id(master passphrase, persisted salt) -> 32 bytes
//! - Cipher: ChaCha20-Poly1305, fresh random nonce per message
//! - Layout: `nonce (12) || ciphertext || tag (16)`
//!
//! The salt is generated once and stored next to the data so the same
//! passphrase re-derives the same key across restarts. Any decryption
//! failure is fatal: there is no partial recovery.

use std::fs;
use std::io::Write;
use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Length of a freshly generated salt
pub const SALT_LEN: usize = 32;

/// Shortest salt accepted from disk (Argon2 minimum)
const MIN_SALT_LEN: usize = 8;

pub const NONCE_LEN: usize = 12;

pub const TAG_LEN: usize = 16;

/// Vault errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid salt ({0} bytes)")]
    InvalidSalt(usize),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed (wrong passphrase or corrupted data)")]
    DecryptionFailed,

    #[error("Ciphertext truncated ({0} bytes)")]
    Truncated(usize),

    #[error("Invalid ciphertext encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("UTF-8 decode error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456, // 19 MiB
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Derive the 32-byte vault key from a passphrase and salt
pub fn derive_key(
    passphrase: &str,
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(VaultError::InvalidSalt(salt.len()));
    }

    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;

    Ok(key)
}

/// Generate a new random salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Read the salt file, generating and persisting a new salt if absent
pub fn load_or_create_salt(path: &Path) -> Result<Vec<u8>, VaultError> {
    match fs::read(path) {
        Ok(salt) => {
            if salt.len() < MIN_SALT_LEN {
                tracing::error!("Salt file {:?} is too short ({} bytes)", path, salt.len());
                return Err(VaultError::InvalidSalt(salt.len()));
            }
            tracing::debug!("Loaded vault salt from {:?}", path);
            Ok(salt)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let salt = generate_salt();

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            // Write atomically: write to temp file then rename
            let temp_path = path.with_extension("tmp");
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&salt)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp_path, path)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
            }

            tracing::info!("Generated new vault salt at {:?}", path);
            Ok(salt.to_vec())
        }
        Err(e) => Err(VaultError::Io(e)),
    }
}

/// Encrypts and decrypts secrets with a key derived from the master passphrase
pub struct CredentialVault {
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Derive a vault from a passphrase and an explicit salt
    pub fn new(passphrase: &str, salt: &[u8], kdf: &KdfParams) -> Result<Self, VaultError> {
        let key = derive_key(passphrase, salt, kdf)?;
        Ok(Self { key })
    }

    /// Derive a vault from a passphrase and the salt stored at `salt_path`
    pub fn open(passphrase: &str, salt_path: &Path, kdf: &KdfParams) -> Result<Self, VaultError> {
        let salt = load_or_create_salt(salt_path)?;
        Self::new(passphrase, &salt, kdf)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, VaultError> {
        ChaCha20Poly1305::new_from_slice(&*self.key)
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))
    }

    /// Encrypt raw bytes
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt bytes produced by [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Truncated(ciphertext.len()));
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::DecryptionFailed)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Encrypt a string field for storage in a host record (base64 text)
    pub fn encrypt_string(&self, plaintext: &str) -> Result<String, VaultError> {
        Ok(BASE64.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// Decrypt a base64 string field from a host record
    pub fn decrypt_string(&self, encoded: &str) -> Result<Zeroizing<String>, VaultError> {
        let ciphertext = BASE64.decode(encoded.trim())?;
        let plaintext = self.decrypt(&ciphertext)?;
        let text = String::from_utf8(plaintext.to_vec())?;
        Ok(Zeroizing::new(text))
    }
}

#[cfg(test)]
pub(crate) fn test_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault(passphrase: &str) -> CredentialVault {
        CredentialVault::new(passphrase, &[7u8; SALT_LEN], &test_kdf()).unwrap()
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let key1 = derive_key("master", &[1u8; SALT_LEN], &test_kdf()).unwrap();
        let key2 = derive_key("master", &[1u8; SALT_LEN], &test_kdf()).unwrap();
        assert_eq!(&*key1, &*key2);

        let key3 = derive_key("master", &[2u8; SALT_LEN], &test_kdf()).unwrap();
        assert_ne!(&*key1, &*key3);
    }

    #[test]
    fn test_roundtrip_including_empty() {
        let vault = vault("master");
        let cases: [&[u8]; 4] = [b"", b"p", b"correct horse battery staple", &[0u8; 4096]];
        for plaintext in cases {
            let sealed = vault.encrypt(plaintext).unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
            assert_eq!(&*vault.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_is_fresh_per_message() {
        let vault = vault("master");
        let a = vault.encrypt(b"same").unwrap();
        let b = vault.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let vault = vault("master");
        let mut sealed = vault.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            vault.decrypt(&sealed),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let vault = vault("master");
        let sealed = vault.encrypt(b"secret").unwrap();
        assert!(matches!(
            vault.decrypt(&sealed[..NONCE_LEN + 3]),
            Err(VaultError::Truncated(_))
        ));
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = vault("correct").encrypt(b"secret").unwrap();
        assert!(matches!(
            vault("wrong").decrypt(&sealed),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_string_helpers() {
        let vault = vault("master");
        let stored = vault.encrypt_string("hunter2").unwrap();
        assert_ne!(stored, "hunter2");
        assert_eq!(vault.decrypt_string(&stored).unwrap().as_str(), "hunter2");

        assert!(matches!(
            vault.decrypt_string("not base64!"),
            Err(VaultError::Encoding(_))
        ));
    }

    #[test]
    fn test_salt_is_persisted_once() {
        let temp_dir = TempDir::new().unwrap();
        let salt_path = temp_dir.path().join("data").join("salt");

        let first = load_or_create_salt(&salt_path).unwrap();
        assert_eq!(first.len(), SALT_LEN);
        assert!(salt_path.exists());

        let second = load_or_create_salt(&salt_path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_open_rederives_same_key_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let salt_path = temp_dir.path().join("salt");

        let sealed = CredentialVault::open("master", &salt_path, &test_kdf())
            .unwrap()
            .encrypt(b"persisted")
            .unwrap();

        let reopened = CredentialVault::open("master", &salt_path, &test_kdf()).unwrap();
        assert_eq!(&*reopened.decrypt(&sealed).unwrap(), b"persisted");
    }

    #[test]
    fn test_short_salt_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let salt_path = temp_dir.path().join("salt");
        fs::write(&salt_path, b"abc").unwrap();

        assert!(matches!(
            load_or_create_salt(&salt_path),
            Err(VaultError::InvalidSalt(3))
        ));
    }
}
