//! SSH Configuration

use std::sync::Arc;

use russh::keys::PrivateKey;
use zeroize::Zeroizing;

use super::agent::is_agent_available;
use super::error::SshError;
use super::keys::parse_private_key;
use crate::config::{AuthMethodTag, CredentialVault, Host};

/// SSH connection configuration for a single connect call
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Dial + handshake timeout in seconds
    pub timeout_secs: u64,

    /// Terminal columns
    pub cols: u32,

    /// Terminal rows
    pub rows: u32,
}

impl SshConfig {
    pub fn for_host(host: &Host, auth: AuthMethod, cols: u32, rows: u32) -> Self {
        Self {
            host: host.hostname.clone(),
            port: host.port,
            username: host.username.clone(),
            auth,
            timeout_secs: default_timeout(),
            cols,
            rows,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// `user@host:port` for log lines
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

fn default_timeout() -> u64 {
    30
}

/// Authentication methods supported
#[derive(Clone)]
pub enum AuthMethod {
    /// Password authentication
    Password { password: Zeroizing<String> },

    /// SSH key authentication with an already parsed key
    Key { key: Arc<PrivateKey> },

    /// SSH agent authentication
    Agent,
}

// Never print secrets
impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password { password } => f
                .debug_struct("Password")
                .field("len", &password.len())
                .finish(),
            AuthMethod::Key { key } => f
                .debug_struct("Key")
                .field("algorithm", &key.algorithm().to_string())
                .finish(),
            AuthMethod::Agent => f.write_str("Agent"),
        }
    }
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn key(key: PrivateKey) -> Self {
        Self::Key { key: Arc::new(key) }
    }

    /// Build the auth configuration for a stored host, decrypting its
    /// secrets through the vault
    pub fn from_host(host: &Host, vault: &CredentialVault) -> Result<Self, SshError> {
        match host.auth_method {
            AuthMethodTag::Password => {
                let ciphertext = host
                    .password
                    .as_deref()
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        SshError::Config(format!("no password stored for {}", host.address()))
                    })?;
                let password = vault.decrypt_string(ciphertext)?;
                if password.is_empty() {
                    return Err(SshError::Config(format!(
                        "stored password for {} is empty",
                        host.address()
                    )));
                }
                Ok(Self::Password { password })
            }
            AuthMethodTag::PrivateKey => {
                let ciphertext = host
                    .private_key
                    .as_deref()
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        SshError::Config(format!("no private key stored for {}", host.address()))
                    })?;
                let key_text = vault.decrypt_string(ciphertext)?;
                let key = parse_private_key(&key_text)?;
                Ok(Self::key(key))
            }
            AuthMethodTag::Agent => {
                if !is_agent_available() {
                    return Err(SshError::AgentNotAvailable(
                        "SSH_AUTH_SOCK is not set or the agent socket does not exist"
                            .to_string(),
                    ));
                }
                Ok(Self::Agent)
            }
        }
    }
}
