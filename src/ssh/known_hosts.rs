//! Known hosts management for SSH host key verification
//!
//! Trust-on-first-use store backed by an OpenSSH-format `known_hosts` file.
//! Unknown and changed keys are never accepted implicitly: the caller gets a
//! [`HostKeyInfo`] and must call [`HostKeyTrustStore::accept`] before retrying.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

type HmacSha1 = Hmac<Sha1>;

/// A server host key as presented on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub algorithm: String,
    pub key_base64: String,
}

impl HostKey {
    pub fn new(algorithm: impl Into<String>, key_base64: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            key_base64: key_base64.into(),
        }
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            algorithm: key.algorithm().as_str().to_string(),
            key_base64: BASE64.encode(key.public_key_bytes()),
        }
    }

    /// Parse `"<algorithm> <base64>"` key material
    pub fn parse(material: &str) -> Result<Self, SshError> {
        let mut parts = material.split_whitespace();
        let (Some(algorithm), Some(key_base64)) = (parts.next(), parts.next()) else {
            return Err(SshError::KeyError(
                "host key must be '<algorithm> <base64>'".to_string(),
            ));
        };

        if BASE64.decode(key_base64).is_err() {
            return Err(SshError::KeyError(format!(
                "host key for {} is not valid base64",
                algorithm
            )));
        }

        Ok(Self::new(algorithm, key_base64))
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_from_b64(&self.key_base64)
    }

    /// `"<algorithm> <base64>"`, the form accepted by [`HostKey::parse`]
    pub fn material(&self) -> String {
        format!("{} {}", self.algorithm, self.key_base64)
    }
}

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Host known under a different key (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Details handed back to the caller when a host key needs a decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyInfo {
    /// Trust store name (`host` or `[host]:port`), pass back to accept
    pub hostname: String,
    pub algorithm: String,
    pub fingerprint: String,
    /// `"<algorithm> <base64>"`, pass back to accept
    pub public_key: String,
    pub is_new_host: bool,
}

/// One parsed trust store entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyRecord {
    pub hostname: String,
    pub algorithm: String,
    pub key_base64: String,
    pub fingerprint: String,
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

impl HostKeyEntry {
    fn matches(&self, key: &HostKey) -> bool {
        self.key_type == key.algorithm && self.key_data == key.key_base64
    }
}

/// `|1|<salt>|<hmac>` host name written by `ssh-keygen -H` / `HashKnownHosts`
#[derive(Clone, Debug)]
struct HashedHost {
    token: String,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

impl HashedHost {
    fn parse(token: &str) -> Option<Self> {
        let mut parts = token.strip_prefix("|1|")?.split('|');
        let salt = BASE64.decode(parts.next()?).ok()?;
        let hash = BASE64.decode(parts.next()?).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            token: token.to_string(),
            salt,
            hash,
        })
    }

    /// HMAC-SHA1 of the lookup name (`host` or `[host]:port`) keyed by the salt
    fn matches(&self, name: &str) -> bool {
        let Ok(mut mac) = HmacSha1::new_from_slice(&self.salt) else {
            return false;
        };
        mac.update(name.as_bytes());
        mac.verify_slice(&self.hash).is_ok()
    }
}

/// Parsed file contents
#[derive(Default)]
struct KnownHosts {
    /// Plain host name -> keys (several key types per host are allowed)
    plain: HashMap<String, Vec<HostKeyEntry>>,
    hashed: Vec<(HashedHost, HostKeyEntry)>,
}

impl KnownHosts {
    fn entries_for<'a>(&'a self, lookup_key: &'a str) -> impl Iterator<Item = &'a HostKeyEntry> {
        let plain = self.plain.get(lookup_key).into_iter().flatten();
        let hashed = self
            .hashed
            .iter()
            .filter(move |(host, _)| host.matches(lookup_key))
            .map(|(_, entry)| entry);
        plain.chain(hashed)
    }

    fn len(&self) -> usize {
        self.plain.values().map(Vec::len).sum::<usize>() + self.hashed.len()
    }
}

/// Known hosts store: file on disk plus an in-memory cache of it.
///
/// Mutations hold the write lock across the file update and the cache
/// update, so the two never diverge.
pub struct HostKeyTrustStore {
    hosts: RwLock<KnownHosts>,
    path: PathBuf,
}

impl HostKeyTrustStore {
    /// Open the user's `~/.ssh/known_hosts`
    pub fn open_default() -> Self {
        Self::with_path(crate::config::default_known_hosts_path())
    }

    /// Open a store at a custom path; a missing file is an empty store
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(KnownHosts::default()),
            path,
        };

        if let Err(e) = store.reload() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, replacing the cache
    pub fn reload(&self) -> Result<(), SshError> {
        let mut hosts = self.hosts.write();
        *hosts = self.read_file()?;
        debug!(
            "Loaded {} known host entries ({} plain hosts, {} hashed)",
            hosts.len(),
            hosts.plain.len(),
            hosts.hashed.len()
        );
        Ok(())
    }

    fn read_file(&self) -> Result<KnownHosts, SshError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse_known_hosts(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(KnownHosts::default()),
            Err(e) => Err(SshError::TrustStore(e)),
        }
    }

    /// Normalize hostname for lookup: lowercase, `[host]:22` -> `host`
    pub fn normalize_hostname(host: &str) -> String {
        let host = host.trim().to_lowercase();
        if let Some(inner) = host.strip_prefix('[') {
            if let Some((name, port)) = inner.split_once("]:") {
                if port == "22" {
                    return name.to_string();
                }
                return format!("[{}]:{}", name, port);
            }
            return inner.trim_end_matches(']').to_string();
        }
        host
    }

    /// Create lookup key for host:port
    pub fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Verify a host's public key against plain and hashed entries
    pub fn verify(&self, host: &str, port: u16, key: &HostKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let fingerprint = key.fingerprint();

        let hosts = self.hosts.read();
        let entries: Vec<&HostKeyEntry> = hosts.entries_for(&lookup_key).collect();
        if entries.is_empty() {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        }

        if entries.iter().any(|e| e.matches(key)) {
            debug!(
                "Host key verified for {} (type: {})",
                lookup_key, key.algorithm
            );
            return HostKeyVerification::Verified;
        }

        // Prefer the stored key of the same type when reporting what was expected
        let expected = entries
            .iter()
            .find(|e| e.key_type == key.algorithm)
            .or_else(|| entries.first());
        let expected_fingerprint = expected
            .map(|e| fingerprint_from_b64(&e.key_data))
            .unwrap_or_else(|| "unknown".to_string());

        warn!(
            "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
            lookup_key, key.algorithm, expected_fingerprint, fingerprint
        );
        HostKeyVerification::Changed {
            expected_fingerprint,
            actual_fingerprint: fingerprint,
        }
    }

    /// `None` when the key is trusted, otherwise what the caller must confirm
    pub fn check(&self, host: &str, port: u16, key: &HostKey) -> Option<HostKeyInfo> {
        let is_new_host = match self.verify(host, port, key) {
            HostKeyVerification::Verified => return None,
            HostKeyVerification::Unknown { .. } => true,
            HostKeyVerification::Changed { .. } => false,
        };

        Some(HostKeyInfo {
            hostname: Self::make_key(host, port),
            algorithm: key.algorithm.clone(),
            fingerprint: key.fingerprint(),
            public_key: key.material(),
            is_new_host,
        })
    }

    /// Trust `key_material` (`"<algorithm> <base64>"`) for `hostname`
    pub fn accept(&self, hostname: &str, key_material: &str) -> Result<(), SshError> {
        let hostname = Self::normalize_hostname(hostname);
        if hostname.is_empty() || hostname.contains(char::is_whitespace) {
            return Err(SshError::Config(format!("invalid hostname '{}'", hostname)));
        }
        let key = HostKey::parse(key_material)?;

        let mut hosts = self.hosts.write();
        if hosts.entries_for(&hostname).any(|e| e.matches(&key)) {
            debug!("Host key for {} already trusted", hostname);
            return Ok(());
        }

        self.append_to_file(&hostname, &key.algorithm, &key.key_base64)?;
        hosts
            .plain
            .entry(hostname.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key.algorithm.clone(),
                key_data: key.key_base64,
            });

        info!(
            "Added host key for {} (type: {}) to known_hosts",
            hostname, key.algorithm
        );
        Ok(())
    }

    /// All parsed entries sorted by hostname. Hashed entries are listed under
    /// their `|1|...` token.
    pub fn list(&self) -> Vec<HostKeyRecord> {
        let hosts = self.hosts.read();
        let plain = hosts.plain.iter().flat_map(|(hostname, entries)| {
            entries.iter().map(move |e| (hostname.as_str(), e))
        });
        let hashed = hosts
            .hashed
            .iter()
            .map(|(host, e)| (host.token.as_str(), e));

        let mut records: Vec<HostKeyRecord> = plain
            .chain(hashed)
            .map(|(hostname, e)| HostKeyRecord {
                hostname: hostname.to_string(),
                algorithm: e.key_type.clone(),
                key_base64: e.key_data.clone(),
                fingerprint: fingerprint_from_b64(&e.key_data),
            })
            .collect();
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        records
    }

    /// Drop every line naming `hostname`, in plain or hashed form.
    /// Returns the number of lines removed.
    pub fn remove(&self, hostname: &str) -> Result<usize, SshError> {
        let target = Self::normalize_hostname(hostname);
        let mut hosts = self.hosts.write();

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SshError::TrustStore(e)),
        };

        let mut removed = 0;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                let Some(hostnames) = line.split_whitespace().next() else {
                    return true;
                };
                if hostnames.starts_with('#') || hostnames.starts_with('@') {
                    return true;
                }
                let matches = hostnames.split(',').any(|h| match HashedHost::parse(h) {
                    Some(hashed) => hashed.matches(&target),
                    None => Self::normalize_hostname(h) == target,
                });
                if matches {
                    removed += 1;
                }
                !matches
            })
            .collect();

        if removed > 0 {
            let mut rewritten = kept.join("\n");
            if !rewritten.is_empty() {
                rewritten.push('\n');
            }
            fs::write(&self.path, rewritten).map_err(SshError::TrustStore)?;
            info!("Removed {} known_hosts line(s) for {}", removed, target);
        }

        *hosts = self.read_file()?;
        Ok(removed)
    }

    /// Truncate the file and forget every host
    pub fn clear(&self) -> Result<(), SshError> {
        let mut hosts = self.hosts.write();
        if self.path.exists() {
            fs::write(&self.path, "").map_err(SshError::TrustStore)?;
        }
        *hosts = KnownHosts::default();
        info!("Cleared known_hosts {:?}", self.path);
        Ok(())
    }

    /// Caller holds the write lock
    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SshError::TrustStore)?;
        }

        let needs_newline = fs::read(&self.path)
            .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
            .unwrap_or(false);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(SshError::TrustStore)?;

        let mut line = String::new();
        if needs_newline {
            line.push('\n');
        }
        line.push_str(&format!("{} {} {}\n", host, key_type, key_b64));
        file.write_all(line.as_bytes())
            .map_err(SshError::TrustStore)?;

        Ok(())
    }
}

/// SHA-256 fingerprint in OpenSSH form (`SHA256:<unpadded base64>`)
pub fn fingerprint_from_b64(stored_b64: &str) -> String {
    match BASE64.decode(stored_b64) {
        Ok(bytes) => {
            let hash = Sha256::digest(&bytes);
            format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
        }
        Err(_) => "unknown".to_string(),
    }
}

fn parse_known_hosts(content: &str) -> KnownHosts {
    let mut hosts = KnownHosts::default();

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines, comments and @cert-authority / @revoked markers
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }

        // hostname[,alias...] keytype base64key [comment]
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }

        let entry = HostKeyEntry {
            key_type: parts[1].to_string(),
            key_data: parts[2].to_string(),
        };

        for hostname in parts[0].split(',') {
            if hostname.is_empty() {
                continue;
            }
            if hostname.starts_with('|') {
                match HashedHost::parse(hostname) {
                    Some(hashed) => hosts.hashed.push((hashed, entry.clone())),
                    None => debug!("Skipping malformed hashed host {}", hostname),
                }
                continue;
            }
            hosts
                .plain
                .entry(HostKeyTrustStore::normalize_hostname(hostname))
                .or_default()
                .push(entry.clone());
        }
    }

    hosts
}
