//! Service bootstrap
//!
//! Wires settings, the credential vault, the trust store and a russh-backed
//! [`SessionManager`] together, and resolves hosts through a [`HostRegistry`]
//! supplied by the persistence layer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{CredentialVault, Host, Settings, SettingsStorage};
use crate::session::{ConnectOutcome, ExecOutcome, ManagerOptions, SessionManager};
use crate::ssh::{HostKeyTrustStore, RusshConnector, SshError};

/// Read access to stored hosts
#[async_trait]
pub trait HostRegistry: Send + Sync {
    async fn get_host(&self, host_id: &str) -> Result<Option<Host>, SshError>;

    /// Stamp the host as used now
    async fn touch_last_used(&self, host_id: &str) -> Result<(), SshError>;
}

pub struct SshService {
    registry: Arc<dyn HostRegistry>,
    manager: Arc<SessionManager>,
}

impl SshService {
    pub fn new(registry: Arc<dyn HostRegistry>, manager: Arc<SessionManager>) -> Self {
        Self { registry, manager }
    }

    /// Load settings from `storage` and bootstrap from them
    pub async fn load(
        storage: &SettingsStorage,
        registry: Arc<dyn HostRegistry>,
    ) -> Result<Self, SshError> {
        let settings = storage
            .load()
            .await
            .map_err(|e| SshError::Config(format!("failed to load settings: {}", e)))?;
        Self::bootstrap(settings, registry).await
    }

    /// Open the vault (salt file + master passphrase), the trust store and a
    /// russh-backed session manager
    pub async fn bootstrap(
        settings: Settings,
        registry: Arc<dyn HostRegistry>,
    ) -> Result<Self, SshError> {
        let salt_path = settings
            .salt_path()
            .map_err(|e| SshError::Config(e.to_string()))?;
        let passphrase = settings.passphrase.resolve();
        let kdf = settings.kdf;

        // Argon2 is deliberately slow; keep it off the async workers
        let vault = tokio::task::spawn_blocking(move || {
            CredentialVault::open(&passphrase, &salt_path, &kdf)
        })
        .await
        .map_err(|e| SshError::Config(format!("vault task failed: {}", e)))??;

        let known_hosts = settings.resolved_known_hosts_path();
        let trust = Arc::new(HostKeyTrustStore::with_path(known_hosts));
        info!("Trust store at {:?}", trust.path());

        let manager = SessionManager::new(
            Arc::new(RusshConnector::new()),
            trust,
            Arc::new(vault),
            ManagerOptions::from(&settings),
        );

        Ok(Self::new(registry, Arc::new(manager)))
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    async fn resolve(&self, host_id: &str) -> Result<Host, SshError> {
        self.registry
            .get_host(host_id)
            .await?
            .ok_or_else(|| SshError::HostNotFound(host_id.to_string()))
    }

    /// Connect to a stored host by id and stamp it as used on success
    pub async fn connect_host(&self, host_id: &str, cols: u32, rows: u32) -> ConnectOutcome {
        let host = match self.resolve(host_id).await {
            Ok(host) => host,
            Err(e) => return ConnectOutcome::Failed(e),
        };

        let outcome = self.manager.connect(&host, cols, rows).await;
        if outcome.is_connected() {
            if let Err(e) = self.registry.touch_last_used(host_id).await {
                warn!("Failed to update last-used for host {}: {}", host_id, e);
            }
        }
        outcome
    }

    /// Run a single command on a stored host
    pub async fn execute_on_host(&self, host_id: &str, command: &str) -> ExecOutcome {
        match self.resolve(host_id).await {
            Ok(host) => self.manager.execute_command(&host, command).await,
            Err(e) => ExecOutcome::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::vault::test_kdf;
    use crate::config::{AuthMethodTag, PassphraseSource};
    use crate::ssh::ErrorKind;
    use crate::testing::{fast_output_settings, FakeConnector, MemoryRegistry};

    fn test_settings(dir: &std::path::Path) -> Settings {
        Settings {
            data_dir: Some(dir.to_path_buf()),
            known_hosts_path: Some(dir.join("known_hosts")),
            kdf: test_kdf(),
            passphrase: PassphraseSource::Literal {
                passphrase: "correct horse".to_string(),
            },
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_bootstrap_creates_salt_and_trust_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::default());

        let service = SshService::bootstrap(test_settings(dir.path()), registry)
            .await
            .unwrap();

        assert!(dir.path().join("salt").exists());
        assert_eq!(
            service.manager().trust_store().path(),
            dir.path().join("known_hosts")
        );
        assert_eq!(service.manager().session_count(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_short_salt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("salt"), b"abc").unwrap();
        let registry = Arc::new(MemoryRegistry::default());

        let err = match SshService::bootstrap(test_settings(dir.path()), registry).await {
            Err(e) => e,
            Ok(_) => panic!("short salt accepted"),
        };
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[tokio::test]
    async fn test_load_from_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SettingsStorage::with_path(dir.path().join("settings.json"));
        storage.save(&test_settings(dir.path())).await.unwrap();

        let service = SshService::load(&storage, Arc::new(MemoryRegistry::default()))
            .await
            .unwrap();
        assert_eq!(
            service.manager().trust_store().path(),
            dir.path().join("known_hosts")
        );
    }

    #[tokio::test]
    async fn test_connect_host_resolves_and_touches() {
        let dir = tempfile::tempdir().unwrap();
        let vault =
            Arc::new(CredentialVault::new("pass", &[9u8; 32], &test_kdf()).unwrap());
        let trust = Arc::new(HostKeyTrustStore::with_path(dir.path().join("known_hosts")));

        let mut host = Host::new("web", "web.internal", 22, "deploy", AuthMethodTag::Password);
        host.password = Some(vault.encrypt_string("pw").unwrap());
        let host_id = host.id.clone();

        let registry = Arc::new(MemoryRegistry::with_hosts([host]));
        let options = ManagerOptions {
            output: fast_output_settings(),
            ..ManagerOptions::default()
        };
        let manager = Arc::new(SessionManager::new(
            Arc::new(FakeConnector::new()),
            trust,
            vault,
            options,
        ));
        let service = SshService::new(registry.clone(), manager);

        let missing = service.connect_host("nope", 80, 24).await;
        assert_eq!(missing.error().unwrap().kind(), ErrorKind::NotFound);

        let first = service.connect_host(&host_id, 80, 24).await;
        let info = first.verification().unwrap();
        assert!(registry.host(&host_id).unwrap().last_used.is_none());

        service
            .manager()
            .accept_host_key(&info.hostname, &info.public_key)
            .unwrap();
        let connected = service.connect_host(&host_id, 80, 24).await;
        assert!(connected.is_connected());
        assert!(registry.host(&host_id).unwrap().last_used.is_some());

        match service.execute_on_host(&host_id, "id").await {
            ExecOutcome::Completed(out) => assert_eq!(out.output, "ran: id\n"),
            other => panic!("expected Completed, got {:?}", other),
        }
    }
}
