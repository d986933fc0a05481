//! SSH agent authentication
//!
//! Signing is delegated to the local agent (`SSH_AUTH_SOCK` on Unix, the
//! OpenSSH named pipe on Windows). Identities are offered one at a time
//! until the server accepts one.

use std::ffi::OsStr;
use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key::{self, HashAlg, PublicKey};
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Borrows the agent for one sign request. The key is cloned before the
/// await so the returned future does not hold the caller's borrow.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            let signature = self.agent.sign_request(&key, hash_alg, to_sign).await?;
            Ok(signature)
        }
    }
}

/// Outcome of offering one agent identity
enum Offer {
    Accepted,
    Rejected,
    Failed(String),
}

/// Connection to the local SSH agent
pub struct SshAgentClient {
    agent: DynAgent,
}

impl SshAgentClient {
    pub async fn connect() -> Result<Self, SshError> {
        #[cfg(unix)]
        let agent = AgentClient::connect_env()
            .await
            .map(|agent| agent.dynamic())
            .map_err(|e| SshError::AgentNotAvailable(format!("SSH_AUTH_SOCK: {}", e)));

        #[cfg(windows)]
        let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
            .await
            .map(|agent| agent.dynamic())
            .map_err(|e| SshError::AgentNotAvailable(format!("agent pipe: {}", e)));

        #[cfg(not(any(unix, windows)))]
        let agent: Result<DynAgent, SshError> = Err(SshError::AgentNotAvailable(
            "no agent transport on this platform".to_string(),
        ));

        let agent = agent?;
        debug!("Connected to SSH agent");
        Ok(Self { agent })
    }

    /// Public keys the agent holds; an empty agent cannot authenticate anyone
    async fn identities(&mut self) -> Result<Vec<PublicKey>, SshError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("listing identities: {}", e)))?;

        if keys.is_empty() {
            return Err(SshError::AuthenticationFailed(
                "SSH agent holds no identities".to_string(),
            ));
        }
        Ok(keys)
    }

    async fn offer(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
        key: &PublicKey,
    ) -> Offer {
        let mut signer = AgentSigner {
            agent: &mut self.agent,
        };
        match handle
            .authenticate_publickey_with(username, key.clone(), None, &mut signer)
            .await
        {
            Ok(result) if result.success() => Offer::Accepted,
            Ok(_) => Offer::Rejected,
            Err(e) => Offer::Failed(e.to_string()),
        }
    }

    /// Offer each agent identity in turn
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<(), SshError> {
        let keys = self.identities().await?;
        let mut failures = Vec::new();

        for key in &keys {
            let fingerprint = key.fingerprint(HashAlg::Sha256);
            match self.offer(handle, username, key).await {
                Offer::Accepted => {
                    info!("Agent identity {} accepted for {}", fingerprint, username);
                    return Ok(());
                }
                Offer::Rejected => debug!("Agent identity {} rejected", fingerprint),
                Offer::Failed(e) => {
                    warn!("Agent identity {} could not sign: {}", fingerprint, e);
                    failures.push(e);
                }
            }
        }

        let mut reason = format!(
            "none of {} agent identities accepted for {}",
            keys.len(),
            username
        );
        if let Some(last) = failures.last() {
            reason.push_str(&format!(" (last signing error: {})", last));
        }
        Err(SshError::AuthenticationFailed(reason))
    }
}

/// Quick check that an agent endpoint exists; connecting may still fail
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        agent_socket_exists(std::env::var_os("SSH_AUTH_SOCK").as_deref())
    }

    // The named pipe exists whenever the agent service is installed
    #[cfg(windows)]
    {
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg_attr(not(unix), allow(dead_code))]
fn agent_socket_exists(sock: Option<&OsStr>) -> bool {
    sock.filter(|s| !s.is_empty())
        .is_some_and(|s| std::path::Path::new(s).exists())
}
