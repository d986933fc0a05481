//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info};

use super::agent::SshAgentClient;
use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::{HostKey, HostKeyInfo, HostKeyTrustStore};
use super::session::{run_command, start_shell};
use super::transport::{CommandOutput, Connector, Dialed, ShellConnection};

/// Client handler for russh callbacks
///
/// Host keys are checked against the trust store. Anything that is not
/// already trusted is parked in `pending` and the handshake is aborted.
pub struct ClientHandler {
    host: String,
    port: u16,
    trust: Arc<HostKeyTrustStore>,
    pending: Arc<Mutex<Option<HostKeyInfo>>>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        trust: Arc<HostKeyTrustStore>,
        pending: Arc<Mutex<Option<HostKeyInfo>>>,
    ) -> Self {
        Self {
            host,
            port,
            trust,
            pending,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let key = HostKey::from_public_key(server_public_key);

        match self.trust.check(&self.host, self.port, &key) {
            None => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Some(info) => {
                info!(
                    "Host key for {}:{} needs confirmation (new host: {}, fingerprint: {})",
                    self.host, self.port, info.is_new_host, info.fingerprint
                );
                *self.pending.lock() = Some(info);
                Ok(false)
            }
        }
    }
}

/// [`Connector`] backed by real russh connections
#[derive(Debug, Default, Clone)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }

    /// Resolve, connect and run the key exchange under the configured timeout
    async fn dial(
        &self,
        config: &SshConfig,
        trust: Arc<HostKeyTrustStore>,
    ) -> Result<Dialed<Handle<ClientHandler>>, SshError> {
        let pending = Arc::new(Mutex::new(None));
        let handler = ClientHandler::new(config.host.clone(), config.port, trust, pending.clone());

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        info!("Connecting to SSH server at {}:{}", config.host, config.port);

        let connect = async {
            let socket_addr = tokio::net::lookup_host((config.host.as_str(), config.port))
                .await
                .map_err(|e| {
                    SshError::ConnectionFailed(format!(
                        "Failed to resolve {}: {}",
                        config.host, e
                    ))
                })?
                .next()
                .ok_or_else(|| {
                    SshError::ConnectionFailed(format!("No address found for {}", config.host))
                })?;

            client::connect(ssh_config, socket_addr, handler).await
        };

        let result = tokio::time::timeout(Duration::from_secs(config.timeout_secs), connect)
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "connecting to {}:{} took longer than {}s",
                    config.host, config.port, config.timeout_secs
                ))
            })?;

        match result {
            Ok(handle) => Ok(Dialed::Established(handle)),
            Err(e) => match pending.lock().take() {
                Some(info) => Ok(Dialed::NeedsVerification(info)),
                None => Err(e),
            },
        }
    }

    /// Dial and authenticate; the handle is disconnected on auth failure
    async fn establish(
        &self,
        config: &SshConfig,
        trust: Arc<HostKeyTrustStore>,
    ) -> Result<Dialed<Handle<ClientHandler>>, SshError> {
        let mut handle = match self.dial(config, trust).await? {
            Dialed::Established(handle) => handle,
            Dialed::NeedsVerification(info) => return Ok(Dialed::NeedsVerification(info)),
        };

        if let Err(e) = authenticate(&mut handle, config).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(e);
        }

        info!("SSH authentication successful for {}", config.address());
        Ok(Dialed::Established(handle))
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &SshConfig,
) -> Result<(), SshError> {
    let result = match &config.auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(&config.username, password.as_str())
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        AuthMethod::Key { key } => {
            let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), None);
            handle
                .authenticate_publickey(&config.username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        AuthMethod::Agent => {
            let mut agent = SshAgentClient::connect().await?;
            return agent.authenticate(handle, &config.username).await;
        }
    };

    if !result.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "rejected by server for {}",
            config.address()
        )));
    }
    Ok(())
}

#[async_trait]
impl Connector for RusshConnector {
    async fn open_shell(
        &self,
        config: SshConfig,
        trust: Arc<HostKeyTrustStore>,
    ) -> Result<Dialed<ShellConnection>, SshError> {
        let handle = match self.establish(&config, trust).await? {
            Dialed::Established(handle) => handle,
            Dialed::NeedsVerification(info) => return Ok(Dialed::NeedsVerification(info)),
        };

        let label = config.address();
        let controller = spawn_handle_owner_task(handle, label.clone());

        match start_shell(&controller, config.cols, config.rows, label).await {
            Ok(shell) => Ok(Dialed::Established(shell)),
            Err(e) => {
                controller.disconnect().await;
                Err(e)
            }
        }
    }

    async fn exec(
        &self,
        config: SshConfig,
        trust: Arc<HostKeyTrustStore>,
        command: &str,
    ) -> Result<Dialed<CommandOutput>, SshError> {
        let handle = match self.establish(&config, trust).await? {
            Dialed::Established(handle) => handle,
            Dialed::NeedsVerification(info) => return Ok(Dialed::NeedsVerification(info)),
        };

        let controller = spawn_handle_owner_task(handle, config.address());
        let result = run_command(&controller, command).await;
        controller.disconnect().await;

        result.map(Dialed::Established)
    }
}
