//! SSH module - connections, authentication and host key trust
//!
//! Built on russh. A connection is owned by a single task (`handle_owner`);
//! each interactive shell channel is owned by its own task (`session`).
//! [`Connector`] is the seam the session manager dials through.

mod agent;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod keys;
pub mod known_hosts;
mod session;
mod transport;

pub use agent::{is_agent_available, SshAgentClient};
pub use client::{ClientHandler, RusshConnector};
pub use config::{AuthMethod, SshConfig};
pub use error::{ErrorKind, SshError};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{HostKey, HostKeyInfo, HostKeyRecord, HostKeyTrustStore, HostKeyVerification};
pub use session::{run_command, start_shell, RusshShell, SessionCommand};
pub use transport::{CommandOutput, Connector, Dialed, ShellConnection, ShellEvent, ShellIo};
