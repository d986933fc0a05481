//! Session manager
//!
//! Owns the session table, the output broker and the trust store handle.
//! Connect verifies host keys through the trust store and never accepts a
//! new or changed key on its own: the caller gets
//! [`ConnectOutcome::NeedsVerification`], decides, calls
//! [`SessionManager::accept_host_key`] and connects again.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::health;
use super::output::OutputBroker;
use super::types::{ConnectOutcome, ExecOutcome, SessionEntry, SessionInfo, SessionState};
use crate::config::{CredentialVault, Host, OutputSettings, Settings};
use crate::ssh::{
    AuthMethod, Connector, Dialed, HostKeyRecord, HostKeyTrustStore, SshConfig, SshError,
};

/// Connection and terminal defaults the manager applies
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub connect_timeout_secs: u64,
    pub default_cols: u32,
    pub default_rows: u32,
    pub output: OutputSettings,
}

impl From<&Settings> for ManagerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout_secs: settings.connect_timeout_secs,
            default_cols: settings.default_cols,
            default_rows: settings.default_rows,
            output: settings.output,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    broker: OutputBroker,
    trust: Arc<HostKeyTrustStore>,
    vault: Arc<CredentialVault>,
    connector: Arc<dyn Connector>,
    options: ManagerOptions,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        trust: Arc<HostKeyTrustStore>,
        vault: Arc<CredentialVault>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            broker: OutputBroker::new(),
            trust,
            vault,
            connector,
            options,
        }
    }

    pub fn broker(&self) -> &OutputBroker {
        &self.broker
    }

    pub fn trust_store(&self) -> &Arc<HostKeyTrustStore> {
        &self.trust
    }

    /// Connect to a stored host, decrypting its credentials for this call only
    pub async fn connect(&self, host: &Host, cols: u32, rows: u32) -> ConnectOutcome {
        let auth = match AuthMethod::from_host(host, &self.vault) {
            Ok(auth) => auth,
            Err(e) => {
                warn!("Cannot build auth for {}: {}", host.address(), e);
                return ConnectOutcome::Failed(e);
            }
        };
        self.connect_with_auth(host, auth, cols, rows).await
    }

    /// Connect with an auth configuration the caller already holds
    pub async fn connect_with_auth(
        &self,
        host: &Host,
        auth: AuthMethod,
        cols: u32,
        rows: u32,
    ) -> ConnectOutcome {
        let (cols, rows) = self.terminal_size(cols, rows);
        let config = SshConfig::for_host(host, auth, cols, rows)
            .with_timeout(self.options.connect_timeout_secs);

        let shell = match self.connector.open_shell(config, self.trust.clone()).await {
            Ok(Dialed::Established(shell)) => shell,
            Ok(Dialed::NeedsVerification(info)) => {
                info!(
                    "Connect to {} paused for host key confirmation",
                    host.address()
                );
                return ConnectOutcome::NeedsVerification(info);
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", host.address(), e);
                return ConnectOutcome::Failed(e);
            }
        };

        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(SessionEntry::new(id.clone(), host, shell.io, cols, rows));
        entry.transition(SessionState::Active);

        // Snapshot before the pump runs: an immediate EOF must not leak into
        // the Connected result
        let info = entry.info();
        self.sessions.write().insert(id.clone(), entry.clone());
        self.broker
            .start_pump(entry, shell.output, self.options.output);

        info!("Session {} active on {}", id, host.address());
        ConnectOutcome::Connected(info)
    }

    /// Run a single command on a fresh connection to `host`
    pub async fn execute_command(&self, host: &Host, command: &str) -> ExecOutcome {
        let auth = match AuthMethod::from_host(host, &self.vault) {
            Ok(auth) => auth,
            Err(e) => return ExecOutcome::Failed(e),
        };
        let config = SshConfig::for_host(
            host,
            auth,
            self.options.default_cols,
            self.options.default_rows,
        )
        .with_timeout(self.options.connect_timeout_secs);

        match self.connector.exec(config, self.trust.clone(), command).await {
            Ok(Dialed::Established(output)) => {
                debug!(
                    "Command on {} exited with {:?}",
                    host.address(),
                    output.exit_status
                );
                ExecOutcome::Completed(output)
            }
            Ok(Dialed::NeedsVerification(info)) => ExecOutcome::NeedsVerification(info),
            Err(e) => {
                warn!("Command on {} failed: {}", host.address(), e);
                ExecOutcome::Failed(e)
            }
        }
    }

    fn terminal_size(&self, cols: u32, rows: u32) -> (u32, u32) {
        (
            if cols == 0 { self.options.default_cols } else { cols },
            if rows == 0 { self.options.default_rows } else { rows },
        )
    }

    fn get(&self, session_id: &str) -> Result<Arc<SessionEntry>, SshError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SshError::SessionNotFound(session_id.to_string()))
    }

    fn get_active(&self, session_id: &str) -> Result<Arc<SessionEntry>, SshError> {
        let entry = self.get(session_id)?;
        if !entry.is_active() {
            return Err(SshError::SessionInactive(session_id.to_string()));
        }
        Ok(entry)
    }

    /// Write to the remote shell and start a latency probe
    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> Result<(), SshError> {
        let entry = self.get_active(session_id)?;
        if data.is_empty() {
            return Ok(());
        }
        entry.probe.mark_sent();
        entry.io.send(data).await
    }

    pub async fn resize(&self, session_id: &str, cols: u32, rows: u32) -> Result<(), SshError> {
        let entry = self.get_active(session_id)?;
        if cols == 0 || rows == 0 {
            return Err(SshError::Config(format!(
                "invalid terminal size {}x{}",
                cols, rows
            )));
        }
        entry.io.resize(cols, rows).await?;
        entry.set_size(cols, rows);
        debug!("Session {} resized to {}x{}", session_id, cols, rows);
        Ok(())
    }

    /// Keepalive probe with want-reply
    pub async fn check_health(&self, session_id: &str) -> Result<(), SshError> {
        let entry = self.get_active(session_id)?;
        health::check_health(&entry).await
    }

    /// Remove the session from the table, then release its connection and
    /// output buffer
    pub async fn close(&self, session_id: &str) -> Result<(), SshError> {
        let entry = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| SshError::SessionNotFound(session_id.to_string()))?;

        entry.transition(SessionState::Closing);
        entry.io.close().await;
        self.broker.remove(session_id);
        entry.transition(SessionState::Closed);

        info!("Session {} closed", session_id);
        Ok(())
    }

    /// Close every session in the table
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                debug!("Session {} already gone: {}", id, e);
            }
        }
    }

    /// Buffered output since the last read. Also works for sessions whose
    /// remote stream ended, until they are closed.
    pub fn read_output(&self, session_id: &str) -> Result<String, SshError> {
        let _ = self.get(session_id)?;
        self.broker.get_and_clear(session_id)
    }

    /// Snapshot of the active sessions, oldest first. Disconnected sessions
    /// stay reachable through [`Self::session_info`] until closed.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .values()
            .filter(|e| e.is_active())
            .map(|e| e.info())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn session_info(&self, session_id: &str) -> Result<SessionInfo, SshError> {
        Ok(self.get(session_id)?.info())
    }

    /// Last measured latency in milliseconds
    pub fn session_latency(&self, session_id: &str) -> Result<Option<u64>, SshError> {
        Ok(self.get(session_id)?.probe.latency_ms())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Trust `key_material` (`"<algorithm> <base64>"`) for `hostname`
    pub fn accept_host_key(&self, hostname: &str, key_material: &str) -> Result<(), SshError> {
        self.trust.accept(hostname, key_material)
    }

    pub fn known_hosts(&self) -> Vec<HostKeyRecord> {
        self.trust.list()
    }

    pub fn remove_known_host(&self, hostname: &str) -> Result<usize, SshError> {
        self.trust.remove(hostname)
    }

    pub fn clear_known_hosts(&self) -> Result<(), SshError> {
        self.trust.clear()
    }
}
