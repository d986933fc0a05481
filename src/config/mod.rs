//! Configuration Module
//!
//! Settings file, host record types and the credential vault.

pub mod storage;
pub mod types;
pub mod vault;

pub use storage::{
    data_dir, default_known_hosts_path, OutputSettings, PassphraseSource, Settings,
    SettingsError, SettingsStorage,
};
pub use types::{AuthMethodTag, Host};
pub use vault::{CredentialVault, KdfParams, VaultError};
