//! The SSH2 client orchestrator.
//!
//! A client walks `Unresolved → Connected → SessionInitialized → Handshaked →
//! Authenticated → SftpReady`. Each step is its own call; nothing advances on
//! its own. Teardown always runs handles → SFTP → session → socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::channel::{Channel, ExecOutput};
use super::entry::RemoteFileEntry;
use super::error::{Error, Result};
use super::fingerprint::Fingerprint;
use super::net::{self, TokioNetwork};
use super::permission::FilePermission;
use super::retry::{retry_on_block, RetryPolicy};
use super::russh_transport::RusshTransport;
use super::session::SshSession;
use super::sftp::SftpSession;
use super::transport::{Endpoint, FileAttributes, Network, Transport};
use super::ClientConfig;

/// Lifecycle position of an [`Ssh2Client`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Unresolved,
    Connected,
    SessionInitialized,
    Handshaked,
    Authenticated,
    SftpReady,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Unresolved => "unresolved",
            ClientState::Connected => "connected",
            ClientState::SessionInitialized => "session-initialized",
            ClientState::Handshaked => "handshaked",
            ClientState::Authenticated => "authenticated",
            ClientState::SftpReady => "sftp-ready",
        };
        f.write_str(name)
    }
}

/// Client over the default russh engine and tokio sockets.
pub type RemoteClient = Ssh2Client<RusshTransport, TokioNetwork>;

/// Drives one SSH connection from name resolution to SFTP operations.
///
/// Not meant to be shared between tasks; one logical flow owns it.
pub struct Ssh2Client<T: Transport, N: Network<Socket = T::Socket>> {
    config: ClientConfig,
    transport: Arc<T>,
    network: N,
    policy: RetryPolicy,
    cancel: CancellationToken,
    label: String,
    state: ClientState,
    endpoints: Vec<Endpoint>,
    fingerprint: Option<Fingerprint>,
    auth_methods: Option<Vec<String>>,
    // Field order is drop order.
    sftp: Option<SftpSession<T>>,
    session: Option<Arc<SshSession<T>>>,
    socket: Option<T::Socket>,
}

impl RemoteClient {
    pub fn with_russh(config: ClientConfig) -> Self {
        Ssh2Client::new(config, RusshTransport::default(), TokioNetwork)
    }
}

impl<T: Transport, N: Network<Socket = T::Socket>> Ssh2Client<T, N> {
    pub fn new(config: ClientConfig, transport: T, network: N) -> Self {
        let label = config.label();
        let policy = config.retry_policy();
        Self {
            config,
            transport: Arc::new(transport),
            network,
            policy,
            cancel: CancellationToken::new(),
            label,
            state: ClientState::Unresolved,
            endpoints: Vec::new(),
            fingerprint: None,
            auth_methods: None,
            sftp: None,
            session: None,
            socket: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Fingerprint captured by the last successful handshake.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    /// Token that aborts this client's in-flight and future steps.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        log::info!("[{}] Cancelling client", self.label);
        self.cancel.cancel();
    }

    fn expect_state(&self, expected: ClientState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn transition(&mut self, next: ClientState) {
        log::debug!("[{}] {} -> {}", self.label, self.state, next);
        self.state = next;
    }

    fn ssh_session(&self) -> Result<&SshSession<T>> {
        self.session.as_deref().ok_or(Error::MissingSession)
    }

    pub fn sftp(&self) -> Result<&SftpSession<T>> {
        self.sftp.as_ref().ok_or(Error::MissingSession)
    }

    // ── Connection ──────────────────────────────────────────────────────────

    /// Resolve the configured host into connect candidates.
    pub async fn resolve(&mut self) -> Result<&[Endpoint]> {
        self.expect_state(ClientState::Unresolved)?;
        let endpoints = net::resolve(
            &self.network,
            self.config.host(),
            self.config.port(),
            self.config.family(),
        )
        .await?;
        self.endpoints = endpoints;
        Ok(&self.endpoints)
    }

    /// Connect to the first reachable candidate from [`Self::resolve`].
    pub async fn connect(&mut self) -> Result<SocketAddr> {
        self.expect_state(ClientState::Unresolved)?;
        if self.endpoints.is_empty() {
            return Err(Error::HostResolution {
                host: self.config.host().to_string(),
                reason: "not resolved".to_string(),
            });
        }
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled("connect")),
            result = net::connect_first(
                &self.network,
                &self.endpoints,
                self.config.host(),
                self.policy.timeout,
            ) => result,
        };
        let (socket, endpoint) = connected.map_err(|e| match e {
            Error::Connection { host, attempts, .. } => Error::Connection {
                host,
                port: self.config.port(),
                attempts,
            },
            other => other,
        })?;
        self.socket = Some(socket);
        self.transition(ClientState::Connected);
        Ok(endpoint.addr)
    }

    /// Resolve and connect in one step.
    pub async fn start_connection(&mut self) -> Result<SocketAddr> {
        self.resolve().await?;
        self.connect().await
    }

    /// Start a transport session on the connected socket and run the
    /// handshake. Returns the host key fingerprint.
    pub async fn handshake(&mut self) -> Result<Fingerprint> {
        self.expect_state(ClientState::Connected)?;
        let socket = self.socket.take().ok_or(Error::MissingSession)?;

        let Some(native) = self.transport.session_init(socket) else {
            self.transition(ClientState::Unresolved);
            return Err(Error::SessionInit);
        };
        let session = SshSession::new(self.transport.clone(), native);
        self.transition(ClientState::SessionInitialized);

        match self.run_handshake(&session).await {
            Ok(fingerprint) => {
                log::info!("[{}] Handshake complete, host key {}", self.label, fingerprint);
                self.session = Some(Arc::new(session));
                self.fingerprint = Some(fingerprint.clone());
                self.transition(ClientState::Handshaked);
                Ok(fingerprint)
            }
            Err(e) => {
                log::warn!("[{}] Handshake failed: {}", self.label, e);
                drop(session);
                self.transition(ClientState::Unresolved);
                Err(e)
            }
        }
    }

    async fn run_handshake(&self, session: &SshSession<T>) -> Result<Fingerprint> {
        let native = session.native()?;
        self.transport.set_blocking(native, true);
        self.transport.set_timeout(native, self.policy.timeout);

        retry_on_block!(&self.policy, &self.cancel, self.transport.handshake(native)).map_err(
            |e| e.into_error("handshake", &self.policy, |t| Error::Handshake(t.to_string())),
        )?;

        let kind = self.config.hash_kind();
        let digest = self
            .transport
            .hostkey_hash(native, kind)
            .ok_or_else(|| Error::Handshake(format!("no {} host key digest", kind)))?;
        Fingerprint::from_raw(digest, kind)
    }

    /// Connect, handshake and authenticate. Leaves the client SFTP-ready.
    ///
    /// The host's auth method list is fetched before authenticating and
    /// kept, so [`Self::auth_methods`] still answers afterwards.
    pub async fn connect_and_authenticate(&mut self) -> Result<Fingerprint> {
        self.start_connection().await?;
        let fingerprint = self.handshake().await?;
        match self.auth_methods().await {
            Ok(_) => {}
            Err(e @ (Error::Cancelled(_) | Error::Timeout { .. })) => return Err(e),
            Err(e) => log::warn!("[{}] Auth method discovery failed: {}", self.label, e),
        }
        self.authenticate().await?;
        Ok(fingerprint)
    }

    // ── Session queries ─────────────────────────────────────────────────────

    /// Banner sent by the host.
    pub fn banner(&self) -> Result<String> {
        let session = self.ssh_session().map_err(|_| Error::NoBanner)?;
        let native = session.native().map_err(|_| Error::NoBanner)?;
        let raw = self.transport.banner(native).ok_or(Error::NoBanner)?;
        let banner = String::from_utf8_lossy(raw);
        let banner = banner.trim_end_matches(['\r', '\n', '\0']);
        if banner.is_empty() {
            return Err(Error::NoBanner);
        }
        Ok(banner.to_string())
    }

    /// Authentication methods the host offers for the configured user.
    ///
    /// Hosts only answer before authentication, so outside `Handshaked` only
    /// a list fetched earlier can be returned.
    pub async fn auth_methods(&mut self) -> Result<Vec<String>> {
        if let Some(methods) = &self.auth_methods {
            return Ok(methods.clone());
        }
        self.expect_state(ClientState::Handshaked)?;
        let username = self
            .config
            .username()
            .ok_or(Error::MissingCredentials("username"))?;
        let native = self.ssh_session()?.native()?;

        let raw = retry_on_block!(
            &self.policy,
            &self.cancel,
            self.transport.userauth_list(native, username)
        )
        .map_err(|e| {
            e.into_error("list authentication methods", &self.policy, |t| {
                Error::AuthMethodDiscovery(t.to_string())
            })
        })?
        .ok_or_else(|| Error::AuthMethodDiscovery("host sent no method list".to_string()))?;

        let methods: Vec<String> = String::from_utf8_lossy(&raw)
            .split(',')
            .map(|m| m.trim().trim_end_matches('\0'))
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        log::debug!("[{}] Host offers auth methods: {:?}", self.label, methods);
        self.auth_methods = Some(methods.clone());
        Ok(methods)
    }

    /// Case-insensitive check against [`Self::auth_methods`].
    pub async fn supports_auth_method(&mut self, method: &str) -> Result<bool> {
        let methods = self.auth_methods().await?;
        Ok(methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
    }

    // ── Authentication ──────────────────────────────────────────────────────

    /// Password authentication, then SFTP startup.
    ///
    /// A rejected password tears the session down; the client must connect
    /// again. A failed SFTP start leaves the client authenticated so
    /// [`Self::open_sftp`] can be retried.
    pub async fn authenticate(&mut self) -> Result<()> {
        self.expect_state(ClientState::Handshaked)?;
        let username = self
            .config
            .username()
            .ok_or(Error::MissingCredentials("username"))?;
        let password = self
            .config
            .password()
            .ok_or(Error::MissingCredentials("password"))?;
        let native = self.ssh_session()?.native()?;

        let outcome = retry_on_block!(
            &self.policy,
            &self.cancel,
            self.transport.userauth_password(native, username, password)
        );
        if let Err(e) = outcome {
            let err = e.into_error("authenticate", &self.policy, |t| {
                Error::AuthenticationFailed(t.to_string())
            });
            log::warn!("[{}] Authentication failed: {}", self.label, err);
            self.teardown();
            return Err(err);
        }

        log::info!("[{}] Authenticated", self.label);
        self.transition(ClientState::Authenticated);
        self.open_sftp().await
    }

    /// Start the SFTP subsystem on the authenticated session.
    pub async fn open_sftp(&mut self) -> Result<()> {
        self.expect_state(ClientState::Authenticated)?;
        let session = self.session.clone().ok_or(Error::MissingSession)?;
        let sftp = SftpSession::open(session, self.policy, self.cancel.clone()).await?;
        self.sftp = Some(sftp);
        self.transition(ClientState::SftpReady);
        Ok(())
    }

    // ── SFTP operations ─────────────────────────────────────────────────────

    /// Create a directory. With `intermediate`, missing parents are created
    /// as well.
    pub async fn create_directory(
        &self,
        path: &str,
        permission: FilePermission,
        intermediate: bool,
    ) -> Result<()> {
        let sftp = self.sftp()?;
        if intermediate {
            sftp.create_dir_all(path, permission).await
        } else {
            sftp.mkdir(path, permission).await
        }
    }

    pub async fn remove_directory(&self, path: &str) -> Result<()> {
        self.sftp()?.rmdir(path).await
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<RemoteFileEntry>> {
        self.sftp()?.list_dir(path).await
    }

    /// `complex` resolves the canonical path; otherwise the raw link target.
    pub async fn resolve_symlink(&self, path: &str, complex: bool) -> Result<String> {
        self.sftp()?.resolve_symlink(path, complex).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.sftp()?.read_file(path).await
    }

    pub async fn write_file(&self, path: &str, data: &[u8], permission: FilePermission) -> Result<()> {
        self.sftp()?.write_file(path, data, permission).await
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp()?.remove_file(path).await
    }

    pub async fn stat(&self, path: &str) -> Result<FileAttributes> {
        self.sftp()?.stat(path).await
    }

    pub async fn set_permissions(&self, path: &str, permission: FilePermission) -> Result<()> {
        self.sftp()?.set_permissions(path, permission).await
    }

    // ── Channels ────────────────────────────────────────────────────────────

    /// Open a "session" channel on the authenticated connection.
    pub async fn open_channel(&self) -> Result<Channel<'_, T>> {
        if self.state < ClientState::Authenticated {
            return Err(Error::InvalidState {
                expected: ClientState::Authenticated,
                actual: self.state,
            });
        }
        Channel::open(self.ssh_session()?, self.policy, self.cancel.clone()).await
    }

    /// Run a command and collect its stdout and exit code.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self.open_channel().await?;
        let output = async {
            channel.exec(command).await?;
            channel.read_to_end().await
        }
        .await;
        let exit_code = channel.exit_status().unwrap_or(-1);
        channel.close().await;
        let stdout = output?;
        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
        })
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    fn teardown(&mut self) {
        self.sftp = None;
        self.session = None;
        self.socket = None;
        self.fingerprint = None;
        self.auth_methods = None;
        self.endpoints.clear();
        self.transition(ClientState::Unresolved);
    }

    /// Release SFTP, session and socket, in that order.
    pub fn disconnect(&mut self) {
        if self.state != ClientState::Unresolved {
            log::info!("[{}] Disconnecting", self.label);
        }
        self.teardown();
    }
}
