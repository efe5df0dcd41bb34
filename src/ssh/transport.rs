//! The pluggable SSH/SFTP engine boundary.
//!
//! [`Transport`] mirrors the call surface of a libssh2-style engine: opaque
//! native handles, status codes where [`TransportError::WouldBlock`] means
//! "call again", and caller-provided buffers for host-supplied strings.
//! [`Network`] covers name resolution and socket connects.

use std::io;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::time::Duration;

use async_trait::async_trait;

use super::fingerprint::HashKind;

/// Status reported by a transport call that did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Not ready yet; the same call must be issued again.
    #[error("operation would block")]
    WouldBlock,
    /// The caller's buffer cannot hold the result.
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("{message} (code {code})")]
    Failed { code: i32, message: String },
}

impl TransportError {
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        TransportError::Failed {
            code,
            message: message.into(),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Whether an SFTP handle refers to a directory stream or a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenKind {
    File,
    Directory,
}

/// `complex = true` resolves the canonical path, `false` reads the raw link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkMode {
    ReadLink,
    RealPath,
}

impl LinkMode {
    pub fn from_complex(complex: bool) -> Self {
        if complex {
            LinkMode::RealPath
        } else {
            LinkMode::ReadLink
        }
    }
}

/// SFTP v3 `pflags`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(0x01);
    pub const WRITE: OpenFlags = OpenFlags(0x02);
    pub const APPEND: OpenFlags = OpenFlags(0x04);
    pub const CREATE: OpenFlags = OpenFlags(0x08);
    pub const TRUNCATE: OpenFlags = OpenFlags(0x10);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0x20);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Attributes attached to a remote path or directory record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Full `st_mode`, including the file type bits.
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

/// One record written by [`Transport::sftp_readdir`] into the caller's
/// buffers. The lengths bound how much of each buffer is valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirRecord {
    pub name_len: usize,
    pub longentry_len: usize,
    pub attrs: FileAttributes,
}

/// The SSH/SFTP engine the client drives.
///
/// Release calls (`*_free`, `sftp_shutdown`) are synchronous so they can run
/// from `Drop`. A single transport value is shared by every handle it
/// produced; native handles are not shared between threads.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Socket: Send + 'static;
    type Session: Send + Sync + 'static;
    type Sftp: Send + Sync + 'static;
    type Handle: Send + 'static;
    type Channel: Send + 'static;

    /// Wrap a connected socket in a new session. `None` is a null handle.
    fn session_init(&self, socket: Self::Socket) -> Option<Self::Session>;
    fn set_blocking(&self, session: &Self::Session, blocking: bool);
    fn set_timeout(&self, session: &Self::Session, timeout: Duration);
    async fn handshake(&self, session: &Self::Session) -> TransportResult<()>;
    /// Digest of the host key, valid only while `session` is borrowed.
    fn hostkey_hash<'a>(&'a self, session: &'a Self::Session, kind: HashKind) -> Option<&'a [u8]>;
    fn banner<'a>(&'a self, session: &'a Self::Session) -> Option<&'a [u8]>;
    /// Comma separated method names, `None` when the host sent nothing.
    async fn userauth_list(
        &self,
        session: &Self::Session,
        username: &str,
    ) -> TransportResult<Option<Vec<u8>>>;
    async fn userauth_password(
        &self,
        session: &Self::Session,
        username: &str,
        password: &str,
    ) -> TransportResult<()>;
    fn session_free(&self, session: Self::Session);

    async fn sftp_init(&self, session: &Self::Session) -> TransportResult<Self::Sftp>;
    fn sftp_shutdown(&self, sftp: Self::Sftp);
    async fn sftp_mkdir(&self, sftp: &Self::Sftp, path: &str, mode: u32) -> TransportResult<()>;
    async fn sftp_rmdir(&self, sftp: &Self::Sftp, path: &str) -> TransportResult<()>;
    async fn sftp_unlink(&self, sftp: &Self::Sftp, path: &str) -> TransportResult<()>;
    async fn sftp_stat(&self, sftp: &Self::Sftp, path: &str) -> TransportResult<FileAttributes>;
    async fn sftp_setstat(
        &self,
        sftp: &Self::Sftp,
        path: &str,
        attrs: &FileAttributes,
    ) -> TransportResult<()>;
    async fn sftp_open(
        &self,
        sftp: &Self::Sftp,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        kind: OpenKind,
    ) -> TransportResult<Self::Handle>;
    /// Read the next directory record. `Ok(None)` is end of stream.
    async fn sftp_readdir(
        &self,
        handle: &mut Self::Handle,
        name: &mut [u8],
        longentry: &mut [u8],
    ) -> TransportResult<Option<DirRecord>>;
    /// `Ok(0)` is end of file.
    async fn sftp_read(&self, handle: &mut Self::Handle, buf: &mut [u8]) -> TransportResult<usize>;
    async fn sftp_write(&self, handle: &mut Self::Handle, data: &[u8]) -> TransportResult<usize>;
    async fn sftp_close(&self, handle: &mut Self::Handle) -> TransportResult<()>;
    fn sftp_handle_free(&self, handle: Self::Handle);
    /// Write the link target (or canonical path) into `target`, returning its
    /// length, or [`TransportError::BufferTooSmall`].
    async fn sftp_symlink(
        &self,
        sftp: &Self::Sftp,
        path: &str,
        target: &mut [u8],
        mode: LinkMode,
    ) -> TransportResult<usize>;

    /// `Ok(None)` is a null channel handle.
    async fn channel_open_session(
        &self,
        session: &Self::Session,
        window_size: u32,
        packet_size: u32,
    ) -> TransportResult<Option<Self::Channel>>;
    async fn channel_exec(&self, channel: &mut Self::Channel, command: &str) -> TransportResult<()>;
    /// `Ok(0)` is end of stream.
    async fn channel_read(&self, channel: &mut Self::Channel, buf: &mut [u8]) -> TransportResult<usize>;
    fn channel_exit_status(&self, channel: &Self::Channel) -> i32;
    async fn channel_close(&self, channel: &mut Self::Channel) -> TransportResult<()>;
    async fn channel_wait_closed(&self, channel: &mut Self::Channel) -> TransportResult<()>;
    fn channel_free(&self, channel: Self::Channel);
}

/// Address family of a resolved endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// One resolved stream-socket candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn family(&self) -> AddressFamily {
        if self.addr.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        }
    }
}

/// Name resolution and socket connects.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    type Socket: Send + 'static;

    /// Candidates in resolver order.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<Endpoint>>;
    /// Create a socket for the endpoint's family and connect it.
    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> io::Result<Self::Socket>;
}
