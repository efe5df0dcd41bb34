pub mod channel;
pub mod client;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod handle;
pub mod net;
pub mod permission;
pub mod retry;
pub mod russh_transport;
pub mod session;
pub mod sftp;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

pub use client::{ClientState, Ssh2Client};
pub use entry::{FileKind, RemoteFileEntry};
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, HashKind};
pub use permission::{FilePermission, Permission};
pub use retry::RetryPolicy;

/// Which resolved addresses the client will try.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FamilyPreference {
    /// IPv4 only.
    #[default]
    Inet,
    /// IPv6 only.
    Inet6,
    /// Every candidate, in resolver order.
    Any,
}

/// SSH connection configuration.
#[derive(Clone)]
pub struct ClientConfig {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    hash_kind: HashKind,
    family: FamilyPreference,
    timeout: Duration,
}

impl ClientConfig {
    pub const DEFAULT_PORT: u16 = 22;

    /// Fails when `host` is empty.
    pub fn new(host: impl Into<String>) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(Error::InvalidConfig("host address must not be empty".to_string()));
        }
        Ok(Self {
            host,
            port: Self::DEFAULT_PORT,
            username: None,
            password: None,
            hash_kind: HashKind::default(),
            family: FamilyPreference::default(),
            timeout: retry::DEFAULT_TIMEOUT,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Digest used for the host key fingerprint.
    pub fn with_hash_kind(mut self, kind: HashKind) -> Self {
        self.hash_kind = kind;
        self
    }

    pub fn with_address_family(mut self, family: FamilyPreference) -> Self {
        self.family = family;
        self
    }

    /// Bound for every blocking step (connect, handshake, retries).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub(crate) fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash_kind
    }

    pub fn family(&self) -> FamilyPreference {
        self.family
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.timeout,
            ..RetryPolicy::default()
        }
    }

    /// `user@host:port`, used to tag log lines.
    pub fn label(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}:{}", user, self.host, self.port),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("hash_kind", &self.hash_kind)
            .field("family", &self.family)
            .field("timeout", &self.timeout)
            .finish()
    }
}
