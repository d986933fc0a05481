//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to
//! it through a cloneable [`HandleController`] that sends commands over an
//! mpsc channel and waits on a oneshot reply, so the handle is never shared
//! behind a lock.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Upper bound on a keepalive round trip
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a keepalive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply within [`KEEPALIVE_TIMEOUT`], or a soft protocol error
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for PTY/shell or exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// `keepalive@openssh.com` with want-reply
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Cloneable sender side of the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap an existing command sender (used by tests)
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its owner task and return the controller for it
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;

        debug!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // Dropped channel is closed by the server
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let result =
                        match tokio::time::timeout(KEEPALIVE_TIMEOUT, handle.send_keepalive(true))
                            .await
                        {
                            Ok(Ok(())) => PingResult::Ok,
                            Ok(Err(russh::Error::Disconnect)) => {
                                warn!("Keepalive on {}: transport disconnected", label);
                                PingResult::IoError
                            }
                            Ok(Err(e)) => {
                                warn!("Keepalive error on {}: {:?}", label, e);
                                PingResult::Timeout
                            }
                            Err(_) => {
                                warn!(
                                    "Keepalive timeout on {} ({}s)",
                                    label,
                                    KEEPALIVE_TIMEOUT.as_secs()
                                );
                                PingResult::Timeout
                            }
                        };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    debug!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("SSH connection to {} closed", label);
    });

    HandleController { cmd_tx }
}

/// Close the queue and fail everything still in it
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (tx, mut rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);

        tokio::spawn(async move {
            if let Some(HandleCommand::Ping { reply_tx }) = rx.recv().await {
                let _ = reply_tx.send(PingResult::Ok);
            }
        });

        assert_eq!(controller.ping().await, PingResult::Ok);
    }

    #[tokio::test]
    async fn test_dropped_owner_reports_disconnected() {
        let (tx, rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);
        drop(rx);

        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.open_session_channel().await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drain_fails_queued_commands() {
        let (tx, mut rx) = mpsc::channel(4);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(HandleCommand::Ping { reply_tx }).await.unwrap();
        tx.send(HandleCommand::Disconnect).await.unwrap();

        drain_pending_commands(&mut rx);

        assert_eq!(reply_rx.await.unwrap(), PingResult::IoError);
        assert!(tx.send(HandleCommand::Disconnect).await.is_err());
    }
}
