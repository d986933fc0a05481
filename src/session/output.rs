//! Output broker
//!
//! One pump task per active session moves [`ShellEvent`]s from the shell's
//! producer into a per-session [`OutputBuffer`]. Callers drain buffers with
//! [`OutputBroker::get_and_clear`]; drains only lock the one buffer, never the
//! session table.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{SessionEntry, SessionState};
use crate::config::OutputSettings;
use crate::ssh::{ShellEvent, SshError};

/// Bytes received since the last drain
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    total_bytes: u64,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
        self.total_bytes += data.len() as u64;
    }

    /// Take everything buffered as text. An incomplete UTF-8 sequence at the
    /// end stays behind for the next drain; invalid bytes become U+FFFD.
    pub fn drain_utf8(&mut self) -> String {
        let cut = incomplete_tail_start(&self.bytes);
        let tail = self.bytes.split_off(cut);
        let head = std::mem::replace(&mut self.bytes, tail);
        String::from_utf8_lossy(&head).into_owned()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes ever appended, drained or not
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Index where a trailing, not yet complete UTF-8 sequence starts
/// (`bytes.len()` if there is none)
fn incomplete_tail_start(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in (len.saturating_sub(3)..len).rev() {
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > len - i { i } else { len };
    }
    len
}

/// Decrements the live pump count when a pump exits, however it exits
struct PumpGuard(Arc<AtomicUsize>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-session output buffers and the pumps that fill them
#[derive(Default)]
pub struct OutputBroker {
    buffers: DashMap<String, Arc<Mutex<OutputBuffer>>>,
    active_pumps: Arc<AtomicUsize>,
}

impl OutputBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) the buffer for `session_id`
    pub fn register(&self, session_id: &str) -> Arc<Mutex<OutputBuffer>> {
        let buffer = Arc::new(Mutex::new(OutputBuffer::new()));
        self.buffers
            .insert(session_id.to_string(), buffer.clone());
        buffer
    }

    /// Append to a registered buffer; false if it no longer exists
    pub fn append(&self, session_id: &str, data: &[u8]) -> bool {
        let Some(buffer) = self.buffers.get(session_id).map(|b| b.value().clone()) else {
            return false;
        };
        buffer.lock().append(data);
        true
    }

    /// Everything buffered since the last call, then empty
    pub fn get_and_clear(&self, session_id: &str) -> Result<String, SshError> {
        let buffer = self
            .buffers
            .get(session_id)
            .map(|b| b.value().clone())
            .ok_or_else(|| SshError::SessionNotFound(session_id.to_string()))?;
        let text = buffer.lock().drain_utf8();
        Ok(text)
    }

    /// Drop the buffer; true if there was one
    pub fn remove(&self, session_id: &str) -> bool {
        self.buffers.remove(session_id).is_some()
    }

    pub fn has_buffer(&self, session_id: &str) -> bool {
        self.buffers.contains_key(session_id)
    }

    /// Bytes waiting in the buffer
    pub fn buffered_len(&self, session_id: &str) -> Option<usize> {
        self.buffers
            .get(session_id)
            .map(|b| b.value().lock().len())
    }

    /// Number of pump tasks still running
    pub fn active_pumps(&self) -> usize {
        self.active_pumps.load(Ordering::SeqCst)
    }

    /// Register a buffer for `entry` and spawn its pump
    pub fn start_pump(
        &self,
        entry: Arc<SessionEntry>,
        output: mpsc::Receiver<ShellEvent>,
        settings: OutputSettings,
    ) -> JoinHandle<()> {
        let buffer = self.register(&entry.id);
        self.active_pumps.fetch_add(1, Ordering::SeqCst);
        let guard = PumpGuard(self.active_pumps.clone());

        tokio::spawn(async move {
            let _guard = guard;
            run_pump(entry, output, buffer, settings).await;
        })
    }
}

async fn run_pump(
    entry: Arc<SessionEntry>,
    mut output: mpsc::Receiver<ShellEvent>,
    buffer: Arc<Mutex<OutputBuffer>>,
    settings: OutputSettings,
) {
    let read_timeout = Duration::from_millis(settings.read_timeout_ms);
    let error_backoff = Duration::from_millis(settings.error_backoff_ms);
    let idle_delay = Duration::from_millis(settings.idle_delay_ms);

    debug!("Output pump started for session {}", entry.id);

    loop {
        if !entry.is_active() {
            break;
        }

        match tokio::time::timeout(read_timeout, output.recv()).await {
            // Nothing yet; re-check the lifecycle flag
            Err(_) => {}
            Ok(Some(ShellEvent::Data(data))) => {
                if !entry.is_active() {
                    break;
                }
                if !data.is_empty() {
                    buffer.lock().append(&data);
                    if let Some(ms) = entry.probe.observe_output() {
                        debug!("Session {} latency sample: {}ms", entry.id, ms);
                    }
                }
            }
            Ok(Some(ShellEvent::Error(e))) => {
                warn!("Read error on session {}: {}", entry.id, e);
                tokio::time::sleep(error_backoff).await;
                continue;
            }
            Ok(Some(ShellEvent::Eof)) | Ok(None) => {
                if entry.transition(SessionState::Disconnected) {
                    info!("Session {} output ended, marked disconnected", entry.id);
                }
                break;
            }
        }

        tokio::time::sleep(idle_delay).await;
    }

    debug!("Output pump stopped for session {}", entry.id);
}
