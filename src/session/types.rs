//! Session Types and Data Structures

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::health::LatencyProbe;
use crate::config::Host;
use crate::ssh::{CommandOutput, HostKeyInfo, ShellIo, SshError};

/// Session lifecycle state
///
/// `Connecting -> Active -> Closing -> Closed`. An Active session whose
/// remote stream ends becomes `Disconnected` and stays listed until closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Disconnected,
    Closing,
    Closed,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Closing)
                | (Active, Disconnected)
                | (Active, Closing)
                | (Disconnected, Closing)
                | (Closing, Closed)
        )
    }
}

/// A live session as held in the manager's table
pub struct SessionEntry {
    pub id: String,
    /// Host snapshot with secret fields stripped
    pub host: Host,
    pub io: Arc<dyn ShellIo>,
    pub probe: LatencyProbe,
    pub created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    cols: AtomicU32,
    rows: AtomicU32,
}

impl SessionEntry {
    pub fn new(id: String, host: &Host, io: Arc<dyn ShellIo>, cols: u32, rows: u32) -> Self {
        let mut host = host.clone();
        host.password = None;
        host.private_key = None;

        Self {
            id,
            host,
            io,
            probe: LatencyProbe::new(),
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Connecting),
            cols: AtomicU32::new(cols),
            rows: AtomicU32::new(rows),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Move to `next` if the lifecycle allows it
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            debug!(
                "Session {}: ignoring transition {:?} -> {:?}",
                self.id, *state, next
            );
            return false;
        }
        *state = next;
        true
    }

    pub fn size(&self) -> (u32, u32) {
        (
            self.cols.load(Ordering::Relaxed),
            self.rows.load(Ordering::Relaxed),
        )
    }

    pub fn set_size(&self, cols: u32, rows: u32) {
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
    }

    pub fn info(&self) -> SessionInfo {
        let (cols, rows) = self.size();
        SessionInfo {
            id: self.id.clone(),
            host_id: self.host.id.clone(),
            label: self.host.label.clone(),
            hostname: self.host.hostname.clone(),
            port: self.host.port,
            username: self.host.username.clone(),
            state: self.state(),
            cols,
            rows,
            latency_ms: self.probe.latency_ms(),
            created_at: self.created_at,
        }
    }
}

/// Public read model of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host_id: String,
    pub label: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub state: SessionState,
    pub cols: u32,
    pub rows: u32,
    pub latency_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Result of a connect attempt
#[derive(Debug, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ConnectOutcome {
    Connected(SessionInfo),
    /// Host key unknown or changed; accept it and connect again
    NeedsVerification(HostKeyInfo),
    Failed(SshError),
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectOutcome::Connected(_))
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        match self {
            ConnectOutcome::Connected(info) => Some(info),
            _ => None,
        }
    }

    pub fn verification(&self) -> Option<&HostKeyInfo> {
        match self {
            ConnectOutcome::NeedsVerification(info) => Some(info),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SshError> {
        match self {
            ConnectOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Result of a one-shot command
#[derive(Debug, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ExecOutcome {
    Completed(CommandOutput),
    NeedsVerification(HostKeyInfo),
    Failed(SshError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Active));
        assert!(Active.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Disconnected.can_transition_to(Active));
        assert!(!Closing.can_transition_to(Disconnected));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Closing));
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome = ConnectOutcome::Failed(SshError::HostNotFound("h-1".to_string()));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["data"], "Host not found: h-1");
        assert!(outcome.error().is_some());
        assert!(!outcome.is_connected());
    }
}
