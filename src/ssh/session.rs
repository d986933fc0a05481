//! SSH shell channels
//!
//! Each shell channel is owned by its own task. Writes and resizes reach it
//! through [`SessionCommand`]s with oneshot replies; remote output leaves it
//! as [`ShellEvent`]s on an mpsc channel.

use std::time::Duration;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::error::SshError;
use super::handle_owner::{HandleController, PingResult, KEEPALIVE_TIMEOUT};
use super::transport::{CommandOutput, ShellConnection, ShellEvent, ShellIo};

/// How long the server gets to answer a PTY or shell request
const CHANNEL_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered output events per shell
const OUTPUT_QUEUE: usize = 1024;

/// Commands that can be sent to a shell channel task
#[derive(Debug)]
pub enum SessionCommand {
    Data {
        data: Vec<u8>,
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },
    Resize {
        cols: u32,
        rows: u32,
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },
    Close,
}

/// [`ShellIo`] over a russh channel task
pub struct RusshShell {
    cmd_tx: mpsc::Sender<SessionCommand>,
    controller: HandleController,
}

#[async_trait]
impl ShellIo for RusshShell {
    async fn send(&self, data: &[u8]) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Data {
                data: data.to_vec(),
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Resize {
                cols,
                rows,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        match self.controller.ping().await {
            PingResult::Ok => Ok(()),
            PingResult::Timeout => Err(SshError::KeepaliveFailed(format!(
                "no reply within {}s",
                KEEPALIVE_TIMEOUT.as_secs()
            ))),
            PingResult::IoError => {
                Err(SshError::KeepaliveFailed("transport closed".to_string()))
            }
        }
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close).await;
        self.controller.disconnect().await;
    }
}

/// Wait for the Success/Failure answering a want-reply channel request.
/// Output that races ahead of the reply is kept in `early`.
async fn await_channel_reply(
    channel: &mut Channel<Msg>,
    what: &str,
    early: &mut Vec<Vec<u8>>,
) -> Result<(), SshError> {
    let wait = async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(SshError::ProtocolError(format!("{} request rejected", what)))
                }
                Some(ChannelMsg::Data { data }) => early.push(data.to_vec()),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => early.push(data.to_vec()),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(SshError::ProtocolError(format!(
                        "channel closed during {} request",
                        what
                    )))
                }
                Some(_) => {}
            }
        }
    };

    tokio::time::timeout(CHANNEL_REPLY_TIMEOUT, wait)
        .await
        .map_err(|_| SshError::ProtocolError(format!("{} request timed out", what)))?
}

/// Open a channel, request PTY + shell (both want-reply), and spawn the
/// channel task. On error the caller still owns the connection.
pub async fn start_shell(
    controller: &HandleController,
    cols: u32,
    rows: u32,
    label: String,
) -> Result<ShellConnection, SshError> {
    let mut channel = controller.open_session_channel().await?;
    let mut early = Vec::new();

    debug!("Channel opened for {}, requesting PTY {}x{}", label, cols, rows);
    channel
        .request_pty(true, "xterm-256color", cols, rows, 0, 0, &[])
        .await
        .map_err(|e| SshError::ProtocolError(format!("PTY request failed: {}", e)))?;
    await_channel_reply(&mut channel, "PTY", &mut early).await?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| SshError::ProtocolError(format!("Shell request failed: {}", e)))?;
    await_channel_reply(&mut channel, "shell", &mut early).await?;

    info!("Interactive shell started on {}", label);

    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(256);
    let (output_tx, output_rx) = mpsc::channel::<ShellEvent>(OUTPUT_QUEUE);

    tokio::spawn(run_channel(
        channel,
        cmd_rx,
        output_tx,
        early,
        controller.clone(),
        label,
    ));

    Ok(ShellConnection {
        io: std::sync::Arc::new(RusshShell {
            cmd_tx,
            controller: controller.clone(),
        }),
        output: output_rx,
    })
}

async fn run_channel(
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    output_tx: mpsc::Sender<ShellEvent>,
    early: Vec<Vec<u8>>,
    controller: HandleController,
    label: String,
) {
    for chunk in early {
        if output_tx.send(ShellEvent::Data(chunk)).await.is_err() {
            break;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Data { data, reply_tx }) => {
                    let result = channel
                        .data(&data[..])
                        .await
                        .map_err(|e| SshError::ChannelError(e.to_string()));
                    let failed = result.is_err();
                    if let Err(e) = &result {
                        error!("Failed to write to {}: {}", label, e);
                    }
                    let _ = reply_tx.send(result);
                    if failed {
                        let _ = output_tx.send(ShellEvent::Eof).await;
                        break;
                    }
                }
                Some(SessionCommand::Resize { cols, rows, reply_tx }) => {
                    let result = channel
                        .window_change(cols, rows, 0, 0)
                        .await
                        .map_err(|e| SshError::ChannelError(e.to_string()));
                    match &result {
                        Ok(()) => debug!("PTY resized to {}x{} on {}", cols, rows, label),
                        Err(e) => error!("Failed to resize PTY on {}: {}", label, e),
                    }
                    let _ = reply_tx.send(result);
                }
                Some(SessionCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },

            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if output_tx.send(ShellEvent::Data(data.to_vec())).await.is_err() {
                        debug!("Output consumer for {} is gone", label);
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    if output_tx.send(ShellEvent::Data(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Shell on {} exited with status {}", label, exit_status);
                }
                // russh has no recoverable read error to report here, so
                // this task emits Data and Eof only
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    info!("Remote closed the shell on {}", label);
                    let _ = output_tx.send(ShellEvent::Eof).await;
                    break;
                }
                Some(_) => {}
            },
        }
    }

    controller.disconnect().await;
    debug!("Channel task for {} finished", label);
}

/// Run `command` on a fresh channel and collect everything it prints
pub async fn run_command(
    controller: &HandleController,
    command: &str,
) -> Result<CommandOutput, SshError> {
    let mut channel = controller.open_session_channel().await?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ProtocolError(format!("exec request failed: {}", e)))?;

    let mut output = Vec::new();
    let mut exit_status = None;

    // Exit status may arrive after EOF, so read until the channel closes
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, .. }) => output.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status: status }) => exit_status = Some(status),
            Some(ChannelMsg::Failure) => {
                return Err(SshError::ProtocolError("exec request rejected".to_string()))
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    Ok(CommandOutput {
        output: String::from_utf8_lossy(&output).into_owned(),
        exit_status,
    })
}
