//! [`Transport`] implementation on top of russh and russh-sftp.
//!
//! russh is async and never reports "would block", so every call here either
//! completes or fails. Directory handles are read eagerly and served one
//! record at a time.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use super::channel::{DEFAULT_PACKET_SIZE, DEFAULT_WINDOW_SIZE};
use super::fingerprint::HashKind;
use super::retry::DEFAULT_TIMEOUT;
use super::transport::{
    DirRecord, FileAttributes, LinkMode, OpenFlags, OpenKind, Transport, TransportError,
    TransportResult,
};

// Status codes reported in `TransportError::Failed`.
const ERROR_SOCKET: i32 = -7;
const ERROR_KEX: i32 = -8;
const ERROR_AUTH: i32 = -18;
const ERROR_CHANNEL: i32 = -21;
const ERROR_SFTP: i32 = -31;

/// Upper bound on bytes inspected while looking for the identification line.
const MAX_PREAMBLE: usize = 8 * 1024;

fn failed(code: i32, err: impl std::fmt::Display) -> TransportError {
    TransportError::failed(code, err.to_string())
}

// ═══════════════════════════════════════════════════════════
// Host key digests and identification banner
// ═══════════════════════════════════════════════════════════

/// Digests of the host key blob in SSH wire encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HostKeyDigests {
    md5: Vec<u8>,
    sha1: Vec<u8>,
}

impl HostKeyDigests {
    pub(crate) fn of(blob: &[u8]) -> Self {
        Self {
            md5: Md5::digest(blob).to_vec(),
            sha1: ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, blob)
                .as_ref()
                .to_vec(),
        }
    }

    fn get(&self, kind: HashKind) -> &[u8] {
        match kind {
            HashKind::Md5 => &self.md5,
            HashKind::Sha1 => &self.sha1,
        }
    }
}

/// Stream wrapper that records the host's identification line as russh reads
/// it off the wire.
pub(crate) struct BannerTap<S> {
    inner: S,
    preamble: Vec<u8>,
    banner: Arc<OnceLock<Vec<u8>>>,
}

impl<S> BannerTap<S> {
    pub(crate) fn new(inner: S, banner: Arc<OnceLock<Vec<u8>>>) -> Self {
        Self {
            inner,
            preamble: Vec::new(),
            banner,
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        if self.banner.get().is_some() || self.preamble.len() >= MAX_PREAMBLE {
            return;
        }
        self.preamble.extend_from_slice(bytes);
        // Hosts may send other lines before the "SSH-" line.
        let mut start = 0;
        while let Some(pos) = self.preamble[start..].iter().position(|&b| b == b'\n') {
            let line = &self.preamble[start..start + pos + 1];
            if line.starts_with(b"SSH-") {
                let _ = self.banner.set(line.to_vec());
                self.preamble = Vec::new();
                return;
            }
            start += pos + 1;
        }
        self.preamble.drain(..start);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BannerTap<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let fresh = &buf.filled()[before..];
            if !fresh.is_empty() {
                this.observe(fresh);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BannerTap<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// russh client handler: captures the host key, trusts it.
///
/// Host key policy belongs to the caller, which gets the fingerprint back
/// from the handshake.
struct ClientHandler {
    host_key: Arc<OnceLock<HostKeyDigests>>,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let blob = server_public_key.to_bytes()?;
        let _ = self.host_key.set(HostKeyDigests::of(&blob));
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════
// Native handles
// ═══════════════════════════════════════════════════════════

pub struct RusshSession {
    socket: Mutex<Option<TcpStream>>,
    handle: tokio::sync::Mutex<Option<client::Handle<ClientHandler>>>,
    host_key: Arc<OnceLock<HostKeyDigests>>,
    banner: Arc<OnceLock<Vec<u8>>>,
    timeout: Mutex<Duration>,
    // Set when the host accepted "none"; no further auth request gets a reply.
    authenticated: AtomicBool,
}

pub struct RusshSftp {
    inner: SftpSession,
}

pub enum RusshHandle {
    Directory(VecDeque<(String, FileAttributes)>),
    File(File),
}

pub struct RusshChannel {
    inner: russh::Channel<client::Msg>,
    pending: VecDeque<u8>,
    exit_status: Option<u32>,
    closed: bool,
}

impl RusshChannel {
    fn absorb(&mut self, msg: Option<ChannelMsg>) {
        match msg {
            Some(ChannelMsg::Data { data }) => self.pending.extend(data.iter().copied()),
            Some(ChannelMsg::ExitStatus { exit_status }) => self.exit_status = Some(exit_status),
            Some(ChannelMsg::Close) | None => self.closed = true,
            Some(_) => {}
        }
    }
}

impl From<&russh_sftp::protocol::FileAttributes> for FileAttributes {
    fn from(attrs: &russh_sftp::protocol::FileAttributes) -> Self {
        FileAttributes {
            size: attrs.size,
            uid: attrs.uid,
            gid: attrs.gid,
            permissions: attrs.permissions,
            atime: attrs.atime,
            mtime: attrs.mtime,
        }
    }
}

fn to_sftp_attributes(attrs: &FileAttributes) -> russh_sftp::protocol::FileAttributes {
    russh_sftp::protocol::FileAttributes {
        size: attrs.size,
        uid: attrs.uid,
        gid: attrs.gid,
        permissions: attrs.permissions,
        atime: attrs.atime,
        mtime: attrs.mtime,
        ..russh_sftp::protocol::FileAttributes::empty()
    }
}

/// russh-sftp creates without attributes, so the mode follows as a setstat.
async fn apply_mode(sftp: &RusshSftp, path: &str, mode: u32) -> TransportResult<()> {
    let attrs = FileAttributes {
        permissions: Some(mode),
        ..Default::default()
    };
    sftp.inner
        .set_metadata(path, to_sftp_attributes(&attrs))
        .await
        .map_err(|e| failed(ERROR_SFTP, format!("created {} but could not set mode {:o}: {}", path, mode, e)))
}

/// Copy `value` into `target`, or report that `target` is too small.
fn copy_into(value: &[u8], target: &mut [u8]) -> TransportResult<usize> {
    if value.len() > target.len() {
        return Err(TransportError::BufferTooSmall);
    }
    target[..value.len()].copy_from_slice(value);
    Ok(value.len())
}

// ═══════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════

/// The default engine: russh for the SSH layer, russh-sftp for SFTP.
#[derive(Clone, Debug, Default)]
pub struct RusshTransport;

fn connected(
    slot: &mut Option<client::Handle<ClientHandler>>,
) -> TransportResult<&mut client::Handle<ClientHandler>> {
    slot.as_mut()
        .ok_or_else(|| failed(ERROR_SOCKET, "session has not completed the handshake"))
}

#[async_trait]
impl Transport for RusshTransport {
    type Socket = TcpStream;
    type Session = RusshSession;
    type Sftp = RusshSftp;
    type Handle = RusshHandle;
    type Channel = RusshChannel;

    fn session_init(&self, socket: TcpStream) -> Option<RusshSession> {
        Some(RusshSession {
            socket: Mutex::new(Some(socket)),
            handle: tokio::sync::Mutex::new(None),
            host_key: Arc::new(OnceLock::new()),
            banner: Arc::new(OnceLock::new()),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            authenticated: AtomicBool::new(false),
        })
    }

    fn set_blocking(&self, _session: &RusshSession, blocking: bool) {
        log::trace!("russh sessions are always async (blocking={})", blocking);
    }

    fn set_timeout(&self, session: &RusshSession, timeout: Duration) {
        if let Ok(mut slot) = session.timeout.lock() {
            *slot = timeout;
        }
    }

    async fn handshake(&self, session: &RusshSession) -> TransportResult<()> {
        let socket = session
            .socket
            .lock()
            .map_err(|_| failed(ERROR_SOCKET, "socket lock poisoned"))?
            .take()
            .ok_or_else(|| failed(ERROR_SOCKET, "handshake already attempted on this socket"))?;
        let timeout = session
            .timeout
            .lock()
            .map(|t| *t)
            .unwrap_or(DEFAULT_TIMEOUT);

        let config = client::Config {
            window_size: DEFAULT_WINDOW_SIZE,
            maximum_packet_size: DEFAULT_PACKET_SIZE,
            ..Default::default()
        };
        let handler = ClientHandler {
            host_key: session.host_key.clone(),
        };
        let stream = BannerTap::new(socket, session.banner.clone());

        let handle = tokio::time::timeout(timeout, client::connect_stream(Arc::new(config), stream, handler))
            .await
            .map_err(|_| failed(ERROR_KEX, "timed out waiting for key exchange"))?
            .map_err(|e| failed(ERROR_KEX, e))?;
        *session.handle.lock().await = Some(handle);
        Ok(())
    }

    fn hostkey_hash<'a>(&'a self, session: &'a RusshSession, kind: HashKind) -> Option<&'a [u8]> {
        session.host_key.get().map(|digests| digests.get(kind))
    }

    fn banner<'a>(&'a self, session: &'a RusshSession) -> Option<&'a [u8]> {
        session.banner.get().map(Vec::as_slice)
    }

    async fn userauth_list(
        &self,
        session: &RusshSession,
        username: &str,
    ) -> TransportResult<Option<Vec<u8>>> {
        let mut guard = session.handle.lock().await;
        let handle = connected(&mut guard)?;
        let result = handle
            .authenticate_none(username)
            .await
            .map_err(|e| failed(ERROR_AUTH, e))?;
        match result {
            client::AuthResult::Success => {
                session.authenticated.store(true, Ordering::SeqCst);
                Ok(Some(b"none".to_vec()))
            }
            client::AuthResult::Failure {
                remaining_methods, ..
            } => {
                let names: Vec<&'static str> =
                    remaining_methods.iter().map(<&'static str>::from).collect();
                Ok(Some(names.join(",").into_bytes()))
            }
        }
    }

    async fn userauth_password(
        &self,
        session: &RusshSession,
        username: &str,
        password: &str,
    ) -> TransportResult<()> {
        if session.authenticated.load(Ordering::SeqCst) {
            log::debug!("Host accepted \"none\" for {}, skipping password", username);
            return Ok(());
        }
        let mut guard = session.handle.lock().await;
        let handle = connected(&mut guard)?;
        let result = handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| failed(ERROR_AUTH, e))?;
        if result.success() {
            session.authenticated.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(failed(ERROR_AUTH, "Authentication failed (username/password)"))
        }
    }

    fn session_free(&self, session: RusshSession) {
        let Some(handle) = session.handle.into_inner() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = handle
                        .disconnect(Disconnect::ByApplication, "session closed", "en")
                        .await
                    {
                        log::debug!("SSH disconnect: {}", e);
                    }
                });
            }
            Err(_) => drop(handle),
        }
    }

    async fn sftp_init(&self, session: &RusshSession) -> TransportResult<RusshSftp> {
        let mut guard = session.handle.lock().await;
        let channel = connected(&mut guard)?
            .channel_open_session()
            .await
            .map_err(|e| failed(ERROR_CHANNEL, e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| failed(ERROR_CHANNEL, e))?;
        let inner = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| failed(ERROR_SFTP, e))?;
        Ok(RusshSftp { inner })
    }

    fn sftp_shutdown(&self, sftp: RusshSftp) {
        drop(sftp);
    }

    async fn sftp_mkdir(&self, sftp: &RusshSftp, path: &str, mode: u32) -> TransportResult<()> {
        sftp.inner
            .create_dir(path)
            .await
            .map_err(|e| failed(ERROR_SFTP, e))?;
        apply_mode(sftp, path, mode).await
    }

    async fn sftp_rmdir(&self, sftp: &RusshSftp, path: &str) -> TransportResult<()> {
        sftp.inner
            .remove_dir(path)
            .await
            .map_err(|e| failed(ERROR_SFTP, e))
    }

    async fn sftp_unlink(&self, sftp: &RusshSftp, path: &str) -> TransportResult<()> {
        sftp.inner
            .remove_file(path)
            .await
            .map_err(|e| failed(ERROR_SFTP, e))
    }

    async fn sftp_stat(&self, sftp: &RusshSftp, path: &str) -> TransportResult<FileAttributes> {
        let metadata = sftp
            .inner
            .metadata(path)
            .await
            .map_err(|e| failed(ERROR_SFTP, e))?;
        Ok(FileAttributes::from(&metadata))
    }

    async fn sftp_setstat(
        &self,
        sftp: &RusshSftp,
        path: &str,
        attrs: &FileAttributes,
    ) -> TransportResult<()> {
        sftp.inner
            .set_metadata(path, to_sftp_attributes(attrs))
            .await
            .map_err(|e| failed(ERROR_SFTP, e))
    }

    async fn sftp_open(
        &self,
        sftp: &RusshSftp,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        kind: OpenKind,
    ) -> TransportResult<RusshHandle> {
        match kind {
            OpenKind::Directory => {
                let dir = sftp
                    .inner
                    .read_dir(path)
                    .await
                    .map_err(|e| failed(ERROR_SFTP, e))?;
                let entries = dir
                    .map(|entry| (entry.file_name(), FileAttributes::from(&entry.metadata())))
                    .collect();
                Ok(RusshHandle::Directory(entries))
            }
            OpenKind::File => {
                let file = sftp
                    .inner
                    .open_with_flags(
                        path,
                        russh_sftp::protocol::OpenFlags::from_bits_truncate(flags.bits()),
                    )
                    .await
                    .map_err(|e| failed(ERROR_SFTP, e))?;
                if flags.contains(OpenFlags::CREATE) && mode != 0 {
                    apply_mode(sftp, path, mode).await?;
                }
                Ok(RusshHandle::File(file))
            }
        }
    }

    async fn sftp_readdir(
        &self,
        handle: &mut RusshHandle,
        name: &mut [u8],
        _longentry: &mut [u8],
    ) -> TransportResult<Option<DirRecord>> {
        let RusshHandle::Directory(entries) = handle else {
            return Err(failed(ERROR_SFTP, "not a directory handle"));
        };
        let Some((entry, attrs)) = entries.pop_front() else {
            return Ok(None);
        };
        match copy_into(entry.as_bytes(), name) {
            Ok(name_len) => Ok(Some(DirRecord {
                name_len,
                longentry_len: 0,
                attrs,
            })),
            Err(e) => {
                entries.push_front((entry, attrs));
                Err(e)
            }
        }
    }

    async fn sftp_read(&self, handle: &mut RusshHandle, buf: &mut [u8]) -> TransportResult<usize> {
        match handle {
            RusshHandle::File(file) => file.read(buf).await.map_err(|e| failed(ERROR_SFTP, e)),
            RusshHandle::Directory(_) => Err(failed(ERROR_SFTP, "not a file handle")),
        }
    }

    async fn sftp_write(&self, handle: &mut RusshHandle, data: &[u8]) -> TransportResult<usize> {
        match handle {
            RusshHandle::File(file) => file.write(data).await.map_err(|e| failed(ERROR_SFTP, e)),
            RusshHandle::Directory(_) => Err(failed(ERROR_SFTP, "not a file handle")),
        }
    }

    async fn sftp_close(&self, handle: &mut RusshHandle) -> TransportResult<()> {
        match handle {
            RusshHandle::File(file) => file.shutdown().await.map_err(|e| failed(ERROR_SFTP, e)),
            RusshHandle::Directory(entries) => {
                entries.clear();
                Ok(())
            }
        }
    }

    fn sftp_handle_free(&self, handle: RusshHandle) {
        drop(handle);
    }

    async fn sftp_symlink(
        &self,
        sftp: &RusshSftp,
        path: &str,
        target: &mut [u8],
        mode: LinkMode,
    ) -> TransportResult<usize> {
        let resolved = match mode {
            LinkMode::ReadLink => sftp.inner.read_link(path).await,
            LinkMode::RealPath => sftp.inner.canonicalize(path).await,
        }
        .map_err(|e| failed(ERROR_SFTP, e))?;
        copy_into(resolved.as_bytes(), target)
    }

    async fn channel_open_session(
        &self,
        session: &RusshSession,
        window_size: u32,
        packet_size: u32,
    ) -> TransportResult<Option<RusshChannel>> {
        log::trace!("Opening channel (window {}, packet {})", window_size, packet_size);
        let mut guard = session.handle.lock().await;
        let inner = connected(&mut guard)?
            .channel_open_session()
            .await
            .map_err(|e| failed(ERROR_CHANNEL, e))?;
        Ok(Some(RusshChannel {
            inner,
            pending: VecDeque::new(),
            exit_status: None,
            closed: false,
        }))
    }

    async fn channel_exec(&self, channel: &mut RusshChannel, command: &str) -> TransportResult<()> {
        channel
            .inner
            .exec(true, command)
            .await
            .map_err(|e| failed(ERROR_CHANNEL, e))
    }

    async fn channel_read(&self, channel: &mut RusshChannel, buf: &mut [u8]) -> TransportResult<usize> {
        while channel.pending.is_empty() && !channel.closed {
            let msg = channel.inner.wait().await;
            channel.absorb(msg);
        }
        let n = channel.pending.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(channel.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn channel_exit_status(&self, channel: &RusshChannel) -> i32 {
        channel
            .exit_status
            .map(|status| status as i32)
            .unwrap_or(-1)
    }

    async fn channel_close(&self, channel: &mut RusshChannel) -> TransportResult<()> {
        if channel.closed {
            return Ok(());
        }
        channel
            .inner
            .close()
            .await
            .map_err(|e| failed(ERROR_SOCKET, e))
    }

    async fn channel_wait_closed(&self, channel: &mut RusshChannel) -> TransportResult<()> {
        while !channel.closed {
            let msg = channel.inner.wait().await;
            channel.absorb(msg);
        }
        Ok(())
    }

    fn channel_free(&self, channel: RusshChannel) {
        drop(channel);
    }
}
