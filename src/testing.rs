//! Test transports
//!
//! [`FakeConnector`] runs the same host-key decision as the russh handler
//! against a fixed server key, and hands out [`EchoShell`]s that echo their
//! input back the way a remote PTY would. [`TestSshServer`] is a real russh
//! server on a loopback port for exercising [`crate::ssh::RusshConnector`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Host, OutputSettings};
use crate::service::HostRegistry;
use crate::ssh::keys::parse_private_key;
use crate::ssh::{
    AuthMethod, CommandOutput, Connector, Dialed, HostKey, HostKeyInfo, HostKeyTrustStore,
    ShellConnection, ShellEvent, ShellIo, SshConfig, SshError,
};

/// Pump timings short enough for tests
pub fn fast_output_settings() -> OutputSettings {
    OutputSettings {
        read_timeout_ms: 20,
        error_backoff_ms: 5,
        idle_delay_ms: 1,
    }
}

/// Shell that echoes input and answers `echo <text>` lines
pub struct EchoShell {
    tx: mpsc::Sender<ShellEvent>,
    closed: AtomicBool,
    keepalive_ok: AtomicBool,
    resizes: Mutex<Vec<(u32, u32)>>,
    password: Mutex<Option<String>>,
}

impl EchoShell {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<ShellEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let shell = Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
            keepalive_ok: AtomicBool::new(true),
            resizes: Mutex::new(Vec::new()),
            password: Mutex::new(None),
        });
        (shell, rx)
    }

    /// Push an event as if it came from the remote side
    pub async fn emit(&self, event: ShellEvent) {
        let _ = self.tx.send(event).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_keepalive_ok(&self, ok: bool) {
        self.keepalive_ok.store(ok, Ordering::SeqCst);
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().clone()
    }

    /// Password the connection authenticated with, if any
    pub fn password_used(&self) -> Option<String> {
        self.password.lock().clone()
    }
}

#[async_trait]
impl ShellIo for EchoShell {
    async fn send(&self, data: &[u8]) -> Result<(), SshError> {
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }

        let mut reply = data.to_vec();
        let text = String::from_utf8_lossy(data);
        for line in text.lines() {
            if let Some(arg) = line.strip_prefix("echo ") {
                reply.extend_from_slice(format!("{}\r\n", arg).as_bytes());
            }
        }

        self.tx
            .send(ShellEvent::Data(reply))
            .await
            .map_err(|_| SshError::Disconnected)
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }
        self.resizes.lock().push((cols, rows));
        Ok(())
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        if self.keepalive_ok.load(Ordering::SeqCst) && !self.is_closed() {
            Ok(())
        } else {
            Err(SshError::KeepaliveFailed("no reply within 5s".to_string()))
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector with a configurable server key and failure switches
pub struct FakeConnector {
    host_key: RwLock<HostKey>,
    reject_auth: AtomicBool,
    fail_pty: AtomicBool,
    eof_on_open: AtomicBool,
    dials: AtomicUsize,
    shells: Mutex<Vec<Arc<EchoShell>>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            host_key: RwLock::new(HostKey::new("ssh-ed25519", "ZmFrZS1zZXJ2ZXIta2V5")),
            reject_auth: AtomicBool::new(false),
            fail_pty: AtomicBool::new(false),
            eof_on_open: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
            shells: Mutex::new(Vec::new()),
        }
    }

    pub fn set_host_key(&self, key: HostKey) {
        *self.host_key.write() = key;
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_pty(&self, fail: bool) {
        self.fail_pty.store(fail, Ordering::SeqCst);
    }

    /// Shells end their stream before `open_shell` returns
    pub fn set_eof_on_open(&self, eof: bool) {
        self.eof_on_open.store(eof, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn last_shell(&self) -> Option<Arc<EchoShell>> {
        self.shells.lock().last().cloned()
    }

    /// Host key check and authentication, as the russh connector does them
    fn handshake(
        &self,
        config: &SshConfig,
        trust: &HostKeyTrustStore,
    ) -> Result<Option<HostKeyInfo>, SshError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let key = self.host_key.read().clone();
        if let Some(info) = trust.check(&config.host, config.port, &key) {
            return Ok(Some(info));
        }

        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(SshError::AuthenticationFailed(format!(
                "rejected by server for {}",
                config.address()
            )));
        }
        Ok(None)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open_shell(
        &self,
        config: SshConfig,
        trust: Arc<HostKeyTrustStore>,
    ) -> Result<Dialed<ShellConnection>, SshError> {
        if let Some(info) = self.handshake(&config, &trust)? {
            return Ok(Dialed::NeedsVerification(info));
        }

        if self.fail_pty.load(Ordering::SeqCst) {
            return Err(SshError::ProtocolError("PTY request rejected".to_string()));
        }

        let (shell, output) = EchoShell::new();
        if let AuthMethod::Password { password } = &config.auth {
            *shell.password.lock() = Some(password.as_str().to_string());
        }
        self.shells.lock().push(shell.clone());
        if self.eof_on_open.load(Ordering::SeqCst) {
            shell.emit(ShellEvent::Eof).await;
        }

        Ok(Dialed::Established(ShellConnection { io: shell, output }))
    }

    async fn exec(
        &self,
        config: SshConfig,
        trust: Arc<HostKeyTrustStore>,
        command: &str,
    ) -> Result<Dialed<CommandOutput>, SshError> {
        if let Some(info) = self.handshake(&config, &trust)? {
            return Ok(Dialed::NeedsVerification(info));
        }

        Ok(Dialed::Established(CommandOutput {
            output: format!("ran: {}\n", command),
            exit_status: Some(0),
        }))
    }
}

/// Host registry backed by a map
#[derive(Default)]
pub struct MemoryRegistry {
    hosts: RwLock<HashMap<String, Host>>,
}

impl MemoryRegistry {
    pub fn with_hosts(hosts: impl IntoIterator<Item = Host>) -> Self {
        Self {
            hosts: RwLock::new(hosts.into_iter().map(|h| (h.id.clone(), h)).collect()),
        }
    }

    pub fn host(&self, id: &str) -> Option<Host> {
        self.hosts.read().get(id).cloned()
    }
}

#[async_trait]
impl HostRegistry for MemoryRegistry {
    async fn get_host(&self, host_id: &str) -> Result<Option<Host>, SshError> {
        Ok(self.host(host_id))
    }

    async fn touch_last_used(&self, host_id: &str) -> Result<(), SshError> {
        match self.hosts.write().get_mut(host_id) {
            Some(host) => {
                host.last_used = Some(chrono::Utc::now());
                Ok(())
            }
            None => Err(SshError::HostNotFound(host_id.to_string())),
        }
    }
}

pub const HOST_KEY_A: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/host_ed25519_a"
));
pub const HOST_KEY_B: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/host_ed25519_b"
));

struct ServerState {
    host_key: Mutex<PrivateKey>,
    password: String,
    reject_pty: AtomicBool,
    resizes: Mutex<Vec<(u32, u32)>>,
    pty_sizes: Mutex<Vec<(u32, u32)>>,
}

/// russh server on `127.0.0.1`: password auth, a PTY shell that prints `$ `
/// and echoes its input, and `exec` answering `ran: <command>`
pub struct TestSshServer {
    pub port: u16,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl TestSshServer {
    pub async fn start(host_key: &str, password: &str) -> Self {
        let state = Arc::new(ServerState {
            host_key: Mutex::new(parse_private_key(host_key).unwrap()),
            password: password.to_string(),
            reject_pty: AtomicBool::new(false),
            resizes: Mutex::new(Vec::new()),
            pty_sizes: Mutex::new(Vec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                // Config per connection so the host key can be swapped
                let config = Arc::new(server::Config {
                    keys: vec![accept_state.host_key.lock().clone()],
                    auth_rejection_time: Duration::from_millis(10),
                    auth_rejection_time_initial: Some(Duration::ZERO),
                    inactivity_timeout: None,
                    ..Default::default()
                });
                let handler = EchoServerHandler {
                    state: accept_state.clone(),
                };
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    /// Present a different host key on later connections
    pub fn set_host_key(&self, host_key: &str) {
        *self.state.host_key.lock() = parse_private_key(host_key).unwrap();
    }

    pub fn set_reject_pty(&self, reject: bool) {
        self.state.reject_pty.store(reject, Ordering::SeqCst);
    }

    /// PTY sizes requested at shell start
    pub fn pty_sizes(&self) -> Vec<(u32, u32)> {
        self.state.pty_sizes.lock().clone()
    }

    /// Window changes received after shell start
    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.state.resizes.lock().clone()
    }
}

impl Drop for TestSshServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct EchoServerHandler {
    state: Arc<ServerState>,
}

impl server::Handler for EchoServerHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        if password == self.state.password {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.state.reject_pty.load(Ordering::SeqCst) {
            session.channel_failure(channel)?;
        } else {
            self.state.pty_sizes.lock().push((col_width, row_height));
            session.channel_success(channel)?;
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        session.data(channel, CryptoVec::from_slice(b"$ "))?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.data(channel, CryptoVec::from_slice(data))?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state.resizes.lock().push((col_width, row_height));
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let reply = format!("ran: {}\n", String::from_utf8_lossy(data));
        session.data(channel, CryptoVec::from_slice(reply.as_bytes()))?;
        session.exit_status_request(channel, 0)?;
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }
}
