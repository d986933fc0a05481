//! SSH Error types

use serde::Serialize;
use thiserror::Error;

use crate::config::VaultError;

/// Coarse classification of [`SshError`] for callers that branch on the kind
/// of failure rather than the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid authentication material
    Config,
    /// Dial, timeout, authentication or keepalive failure
    Transport,
    /// PTY, channel or shell negotiation failure
    Protocol,
    /// Credential encryption/decryption, known_hosts file or record storage failure
    Storage,
    /// Unknown session or host
    NotFound,
    /// Session exists but is no longer active
    Inactive,
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Private key is encrypted and requires a passphrase (not supported)")]
    PassphraseRequired,

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Keepalive failed: {0}")]
    KeepaliveFailed(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] VaultError),

    #[error("Known hosts file error: {0}")]
    TrustStore(#[source] std::io::Error),

    #[error("Host registry error: {0}")]
    Registry(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is not active: {0}")]
    SessionInactive(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::Config(_)
            | SshError::PassphraseRequired
            | SshError::AgentNotAvailable(_)
            | SshError::KeyError(_) => ErrorKind::Config,
            SshError::ConnectionFailed(_)
            | SshError::AuthenticationFailed(_)
            | SshError::AgentError(_)
            | SshError::Timeout(_)
            | SshError::KeepaliveFailed(_)
            | SshError::IoError(_)
            | SshError::Disconnected => ErrorKind::Transport,
            SshError::ProtocolError(_) | SshError::ChannelError(_) => ErrorKind::Protocol,
            SshError::Storage(_) | SshError::TrustStore(_) | SshError::Registry(_) => {
                ErrorKind::Storage
            }
            SshError::SessionNotFound(_) | SshError::HostNotFound(_) => ErrorKind::NotFound,
            SshError::SessionInactive(_) => ErrorKind::Inactive,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ConnectionFailed(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

// Frontends receive the display string
impl Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
