use std::time::Duration;

use super::client::ClientState;
use super::fingerprint::HashKind;

/// Errors surfaced by the SSH/SFTP engine.
///
/// Transient "would block" conditions never appear here; they are retried
/// until the session timeout elapses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("could not resolve host {host:?}: {reason}")]
    HostResolution { host: String, reason: String },

    #[error("could not connect to {host}:{port} ({attempts} candidate(s) tried)")]
    Connection { host: String, port: u16, attempts: usize },

    #[error("transport returned no session handle")]
    SessionInit,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("{kind} host key digest must be {expected} bytes, got {actual}")]
    FingerprintLength {
        kind: HashKind,
        expected: usize,
        actual: usize,
    },

    #[error("host returned no banner")]
    NoBanner,

    #[error("could not list authentication methods: {0}")]
    AuthMethodDiscovery(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("could not start SFTP session: {0}")]
    SftpSession(String),

    #[error("could not create directory {path}: {reason}")]
    CreateDirectory { path: String, reason: String },

    #[error("could not remove directory {path}: {reason}")]
    RemoveDirectory { path: String, reason: String },

    #[error("could not open directory {path}: {reason}")]
    OpenDirectory { path: String, reason: String },

    #[error("could not read directory {path}: {reason}")]
    ReadDirectory { path: String, reason: String },

    #[error("could not resolve link {path}: {reason}")]
    ResolveSymlink { path: String, reason: String },

    #[error("could not open file {path}: {reason}")]
    OpenFile { path: String, reason: String },

    #[error("could not read file {path}: {reason}")]
    ReadFile { path: String, reason: String },

    #[error("could not write file {path}: {reason}")]
    WriteFile { path: String, reason: String },

    #[error("could not remove file {path}: {reason}")]
    RemoveFile { path: String, reason: String },

    #[error("could not stat {path}: {reason}")]
    Stat { path: String, reason: String },

    #[error("could not change permissions of {path}: {reason}")]
    SetPermissions { path: String, reason: String },

    #[error("could not open channel: {0}")]
    ChannelOpen(String),

    #[error("remote command failed: {0}")]
    Exec(String),

    #[error("no active session")]
    MissingSession,

    #[error("missing credentials: {0} not configured")]
    MissingCredentials(&'static str),

    #[error("operation requires a {expected} client, current state is {actual}")]
    InvalidState {
        expected: ClientState,
        actual: ClientState,
    },

    #[error("{operation} did not finish within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{0} was cancelled")]
    Cancelled(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
