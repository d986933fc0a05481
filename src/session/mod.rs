//! Session Management Module
//!
//! - [`SessionManager`]: connect with host key trust, session table, input/resize/close
//! - [`OutputBroker`]: per-session output pumps and read-and-clear buffers
//! - [`health`]: keepalive checks and latency probes

pub mod health;
pub mod manager;
pub mod output;
pub mod types;

pub use health::{check_health, LatencyProbe};
pub use manager::{ManagerOptions, SessionManager};
pub use output::{OutputBroker, OutputBuffer};
pub use types::{ConnectOutcome, ExecOutcome, SessionEntry, SessionInfo, SessionState};
