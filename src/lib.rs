//! Termunator - SSH session orchestration core
//!
//! Encrypted credential vault, trust-on-first-use host keys, interactive
//! PTY sessions over russh and pull-based output buffers.

pub mod config;
pub mod service;
pub mod session;
pub mod ssh;

#[cfg(test)]
mod testing;

pub use service::{HostRegistry, SshService};
pub use session::{ConnectOutcome, ExecOutcome, SessionManager};
pub use ssh::{ErrorKind, SshError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging (`RUST_LOG` overrides the default `info` filter).
/// Calling it again after a subscriber is installed is a no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
