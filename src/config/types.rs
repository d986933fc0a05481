//! Host record types
//!
//! Hosts are owned by the persistence layer; this crate only consumes them.
//! Secret fields hold vault ciphertext and are never decrypted here except
//! for the duration of a single connect call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authentication method tag stored with a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethodTag {
    Password,
    PrivateKey,
    #[serde(rename = "ssh_agent")]
    Agent,
}

impl std::fmt::Display for AuthMethodTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethodTag::Password => write!(f, "password"),
            AuthMethodTag::PrivateKey => write!(f, "private_key"),
            AuthMethodTag::Agent => write!(f, "ssh_agent"),
        }
    }
}

/// A saved host entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub label: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethodTag,
    /// Encrypted password (vault ciphertext, base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Encrypted private key (vault ciphertext, base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_port() -> u16 {
    22
}

impl Host {
    /// New host with no stored secrets
    pub fn new(
        label: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth_method: AuthMethodTag,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            hostname: hostname.into(),
            port,
            username: username.into(),
            auth_method,
            password: None,
            private_key: None,
            tags: Vec::new(),
            last_used: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `user@host:port` for log lines
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}
