//! Host key fingerprints.
//!
//! The transport reports the digest of the server's host key as a borrowed
//! byte buffer that is only valid while the session is untouched. A
//! [`Fingerprint`] copies those bytes into owned, fixed-size storage.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use super::error::{Error, Result};

/// Digest algorithm used for a host key fingerprint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    #[default]
    Md5,
    Sha1,
}

impl HashKind {
    /// Digest size in bytes.
    pub const fn digest_len(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashKind::Md5 => f.write_str("MD5"),
            HashKind::Sha1 => f.write_str("SHA1"),
        }
    }
}

/// Owned host key digest, tagged by hash kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Md5([u8; 16]),
    Sha1([u8; 20]),
}

impl Fingerprint {
    /// Copy a raw digest into a fingerprint of the given kind.
    pub fn from_raw(bytes: &[u8], kind: HashKind) -> Result<Self> {
        let length_error = || Error::FingerprintLength {
            kind,
            expected: kind.digest_len(),
            actual: bytes.len(),
        };
        match kind {
            HashKind::Md5 => bytes.try_into().map(Fingerprint::Md5).map_err(|_| length_error()),
            HashKind::Sha1 => bytes.try_into().map(Fingerprint::Sha1).map_err(|_| length_error()),
        }
    }

    pub fn kind(&self) -> HashKind {
        match self {
            Fingerprint::Md5(_) => HashKind::Md5,
            Fingerprint::Sha1(_) => HashKind::Sha1,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Fingerprint::Md5(bytes) => bytes,
            Fingerprint::Sha1(bytes) => bytes,
        }
    }

    /// Lowercase hex, one `:` between each byte: `01:02:...:10`.
    pub fn render(&self) -> String {
        self.as_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
