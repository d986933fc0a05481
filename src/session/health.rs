//! Connection health and latency
//!
//! Latency is estimated, not measured: the first output that arrives after
//! an input or keepalive probe counts as its reply. Any output at all will do,
//! so a busy shell makes the number look better than the link really is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::types::SessionEntry;
use crate::ssh::SshError;

const NO_SAMPLE: u64 = u64::MAX;

/// Pending probe timestamp plus the last latency sample
#[derive(Debug)]
pub struct LatencyProbe {
    pending: Mutex<Option<Instant>>,
    last_ms: AtomicU64,
}

impl Default for LatencyProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyProbe {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            last_ms: AtomicU64::new(NO_SAMPLE),
        }
    }

    /// Start (or restart) a probe now
    pub fn mark_sent(&self) {
        *self.pending.lock() = Some(Instant::now());
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Output arrived: close the pending probe, if any, and record its latency
    pub fn observe_output(&self) -> Option<u64> {
        let sent = self.pending.lock().take()?;
        let elapsed = sent.elapsed().as_millis().min(u128::from(NO_SAMPLE - 1)) as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
        Some(elapsed)
    }

    /// Last recorded latency in milliseconds
    pub fn latency_ms(&self) -> Option<u64> {
        match self.last_ms.load(Ordering::Relaxed) {
            NO_SAMPLE => None,
            ms => Some(ms),
        }
    }
}

/// Mark a probe and send a keepalive with want-reply over the session's
/// connection
pub async fn check_health(entry: &SessionEntry) -> Result<(), SshError> {
    entry.probe.mark_sent();

    match entry.io.keepalive().await {
        Ok(()) => {
            debug!("Keepalive OK for session {}", entry.id);
            Ok(())
        }
        Err(e) => {
            warn!("Health check failed for session {}: {}", entry.id, e);
            let reason = match e {
                SshError::KeepaliveFailed(msg) => msg,
                other => other.to_string(),
            };
            Err(SshError::KeepaliveFailed(format!(
                "session {}: {}",
                entry.id, reason
            )))
        }
    }
}
