//! Transport seam between the session manager and the SSH stack
//!
//! [`Connector`] dials, verifies the host key, authenticates and hands back
//! either an interactive shell or a one-shot command result. The russh
//! implementation lives in `client`; tests plug in an in-memory one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::config::SshConfig;
use super::error::SshError;
use super::known_hosts::{HostKeyInfo, HostKeyTrustStore};

/// Chunks pushed by a shell's producer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Data(Vec<u8>),
    /// Remote end closed the stream; nothing follows
    Eof,
    /// Transient read failure; the producer keeps going. The russh channel
    /// task never sends it: `Channel::wait` only yields messages or `None`,
    /// and `None` is the end of the stream.
    Error(String),
}

/// Write side of an interactive shell
#[async_trait]
pub trait ShellIo: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), SshError>;

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError>;

    /// `keepalive@openssh.com` with want-reply
    async fn keepalive(&self) -> Result<(), SshError>;

    /// Close the channel and the connection under it
    async fn close(&self);
}

/// An established shell: write handle plus its output stream
pub struct ShellConnection {
    pub io: Arc<dyn ShellIo>,
    pub output: mpsc::Receiver<ShellEvent>,
}

/// Result of a dial that got as far as host-key verification
pub enum Dialed<T> {
    Established(T),
    /// Host key unknown or changed; the connection was aborted
    NeedsVerification(HostKeyInfo),
}

/// Output of a one-shot remote command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    /// stdout and stderr interleaved in arrival order
    pub output: String,
    pub exit_status: Option<u32>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial, verify, authenticate, then request PTY + shell
    async fn open_shell(
        &self,
        config: SshConfig,
        trust: Arc<HostKeyTrustStore>,
    ) -> Result<Dialed<ShellConnection>, SshError>;

    /// Dial, verify, authenticate, run `command` and disconnect
    async fn exec(
        &self,
        config: SshConfig,
        trust: Arc<HostKeyTrustStore>,
        command: &str,
    ) -> Result<Dialed<CommandOutput>, SshError>;
}
