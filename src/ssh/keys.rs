//! Private key parsing
//!
//! Key material arrives decrypted from the vault as text (OpenSSH or PEM).
//! Passphrase-protected keys are detected up front and rejected, since there
//! is no prompt to ask for the passphrase.

use russh::keys::ssh_key;
use russh::keys::PrivateKey;
use thiserror::Error;
use tracing::debug;

use super::error::SshError;

/// Errors that can occur during key loading
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Private key is empty")]
    Empty,

    #[error("Failed to parse key: {0}")]
    ParseError(String),

    #[error("Encrypted key requires passphrase")]
    PassphraseRequired,
}

impl From<KeyError> for SshError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::PassphraseRequired => SshError::PassphraseRequired,
            other => SshError::Config(format!("invalid private key: {}", other)),
        }
    }
}

/// Whether the key text is passphrase-protected
pub fn is_encrypted_key(key_data: &str) -> bool {
    // Legacy PEM: "Proc-Type: 4,ENCRYPTED"; PKCS#8: "BEGIN ENCRYPTED PRIVATE KEY"
    if key_data.contains("ENCRYPTED") {
        return true;
    }

    // OpenSSH format keeps the cipher name inside the base64 body
    ssh_key::PrivateKey::from_openssh(key_data.trim())
        .map(|key| key.is_encrypted())
        .unwrap_or(false)
}

/// Parse an unencrypted private key from its text form
pub fn parse_private_key(key_data: &str) -> Result<PrivateKey, KeyError> {
    let key_data = key_data.trim();
    if key_data.is_empty() {
        return Err(KeyError::Empty);
    }

    if is_encrypted_key(key_data) {
        return Err(KeyError::PassphraseRequired);
    }

    let key = russh::keys::decode_secret_key(key_data, None)
        .map_err(|e| KeyError::ParseError(e.to_string()))?;
    debug!("Parsed {} private key", describe_key(&key));
    Ok(key)
}

/// Get key type description
pub fn describe_key(key: &PrivateKey) -> String {
    key.algorithm().to_string()
}
